//! Paging properties: concatenating pages in either direction yields the
//! complete, duplicate-free item list for arbitrary store sizes and page
//! geometries.

use proptest::prelude::*;
use sop::{
    Context, Database, DatabaseOptions, Item, Key, PagingDirection, PagingInfo, StoreOptions,
    TransactionOptions,
};
use tempfile::TempDir;

fn filled_store(count: usize, slot_length: usize) -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    let store = db
        .new_store(
            &ctx,
            &tx,
            "paged",
            StoreOptions {
                is_unique: true,
                slot_length,
                ..Default::default()
            },
            None,
        )
        .unwrap();
    let items: Vec<Item> = (0..count)
        .map(|i| Item::new(format!("k{:06}", i), format!("v{}", i)))
        .collect();
    if !items.is_empty() {
        store.add(&ctx, &items).unwrap();
    }
    tx.commit(&ctx).unwrap();
    (dir, db)
}

fn collect_all(db: &Database, page_size: usize, direction: PagingDirection) -> Vec<Key> {
    let ctx = Context::new();
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::reading())
        .unwrap();
    let store = db.open_store(&ctx, &tx, "paged").unwrap();
    let positioned = match direction {
        PagingDirection::Forward => store.first(&ctx).unwrap(),
        PagingDirection::Backward => store.last(&ctx).unwrap(),
    };
    if !positioned {
        return Vec::new();
    }
    let mut paging = PagingInfo::forward(page_size);
    paging.direction = direction;
    let mut keys = Vec::new();
    loop {
        let page = store.get_keys(&ctx, paging).unwrap();
        if page.is_empty() {
            break;
        }
        keys.extend(page.into_iter().map(|item| item.key));
    }
    keys
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn forward_pages_concatenate_losslessly(
        count in 0usize..120,
        page_size in 1usize..25,
        slot_length in 2usize..12,
    ) {
        let (_dir, db) = filled_store(count, slot_length);
        let keys = collect_all(&db, page_size, PagingDirection::Forward);
        let expected: Vec<Key> = (0..count).map(|i| Key::from(format!("k{:06}", i))).collect();
        prop_assert_eq!(keys, expected);
    }

    #[test]
    fn backward_pages_are_forward_reversed(
        count in 0usize..120,
        page_size in 1usize..25,
    ) {
        let (_dir, db) = filled_store(count, 6);
        let mut backward = collect_all(&db, page_size, PagingDirection::Backward);
        backward.reverse();
        let forward = collect_all(&db, page_size.max(7), PagingDirection::Forward);
        prop_assert_eq!(backward, forward);
    }
}

#[test]
fn page_offset_skips_whole_pages() {
    let (_dir, db) = filled_store(50, 6);
    let ctx = Context::new();
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::reading())
        .unwrap();
    let store = db.open_store(&ctx, &tx, "paged").unwrap();

    assert!(store.first(&ctx).unwrap());
    let mut paging = PagingInfo::forward(10);
    paging.page_offset = 2;
    let page = store.get_keys(&ctx, paging).unwrap();
    assert_eq!(page.len(), 10);
    assert_eq!(page[0].key, Key::from("k000020"));
}

#[test]
fn fetch_count_is_capped_by_page_size() {
    let (_dir, db) = filled_store(30, 6);
    let ctx = Context::new();
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::reading())
        .unwrap();
    let store = db.open_store(&ctx, &tx, "paged").unwrap();

    assert!(store.first(&ctx).unwrap());
    let mut paging = PagingInfo::forward(5);
    paging.fetch_count = 100;
    assert_eq!(store.get_keys(&ctx, paging).unwrap().len(), 5);
}
