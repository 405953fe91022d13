//! Composite keys: index-spec ordering, comparator expressions, and the
//! structural immutability rules around them.

use sop::{
    Context, Database, DatabaseOptions, Error, FieldValue, IndexFieldSpecification,
    IndexSpecification, Item, Key, PagingInfo, StoreOptions, TransactionOptions,
};
use tempfile::TempDir;

fn employee(region: &str, department: &str, employee_id: i64) -> Key {
    Key::composite([
        ("region", FieldValue::from(region)),
        ("department", FieldValue::from(department)),
        ("employee_id", FieldValue::Integer(employee_id)),
    ])
}

fn employee_spec() -> IndexSpecification {
    IndexSpecification::new(vec![
        IndexFieldSpecification::ascending("region"),
        IndexFieldSpecification::ascending("department"),
        IndexFieldSpecification::ascending("employee_id"),
    ])
}

fn composite_options() -> StoreOptions {
    StoreOptions {
        is_primitive_key: false,
        is_unique: true,
        ..Default::default()
    }
}

#[test]
fn index_spec_orders_iteration() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();

    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    let employees = db
        .new_store(
            &ctx,
            &tx,
            "employees",
            composite_options(),
            Some(employee_spec()),
        )
        .unwrap();
    employees
        .add(
            &ctx,
            &[
                Item::new(employee("US", "Eng", 101), "alice"),
                Item::new(employee("US", "Sales", 202), "bob"),
                Item::new(employee("EU", "Eng", 102), "chloe"),
            ],
        )
        .unwrap();
    tx.commit(&ctx).unwrap();

    let tx = db
        .begin_transaction(&ctx, TransactionOptions::reading())
        .unwrap();
    let employees = db.open_store(&ctx, &tx, "employees").unwrap();
    assert!(employees.first(&ctx).unwrap());
    let keys: Vec<Key> = employees
        .get_keys(&ctx, PagingInfo::forward(10))
        .unwrap()
        .into_iter()
        .map(|item| item.key)
        .collect();
    assert_eq!(
        keys,
        vec![
            employee("EU", "Eng", 102),
            employee("US", "Eng", 101),
            employee("US", "Sales", 202),
        ]
    );
}

#[test]
fn descending_field_inverts_order() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();

    let spec = IndexSpecification::new(vec![IndexFieldSpecification::descending("employee_id")]);
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    let store = db
        .new_store(&ctx, &tx, "newest_first", composite_options(), Some(spec))
        .unwrap();
    for id in [1i64, 3, 2] {
        store
            .add(&ctx, &[Item::new(employee("US", "Eng", id), "x")])
            .unwrap();
    }
    assert!(store.first(&ctx).unwrap());
    let ids: Vec<i64> = store
        .get_keys(&ctx, PagingInfo::forward(10))
        .unwrap()
        .into_iter()
        .map(|item| match item.key.field("employee_id") {
            Some(FieldValue::Integer(id)) => *id,
            other => panic!("unexpected field {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn comparator_expression_store_orders_by_expression() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();

    let options = StoreOptions {
        is_primitive_key: false,
        is_unique: true,
        cel_expression: "mapX.age < mapY.age ? -1 : (mapX.age > mapY.age ? 1 : 0)".to_string(),
        ..Default::default()
    };
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    let store = db.new_store(&ctx, &tx, "by_age", options, None).unwrap();
    for (name, age) in [("old", 70i64), ("young", 7), ("mid", 40)] {
        store
            .add(
                &ctx,
                &[Item::new(
                    Key::composite([
                        ("name", FieldValue::from(name)),
                        ("age", FieldValue::Integer(age)),
                    ]),
                    name,
                )],
            )
            .unwrap();
    }
    assert!(store.first(&ctx).unwrap());
    let ages: Vec<i64> = store
        .get_keys(&ctx, PagingInfo::forward(10))
        .unwrap()
        .into_iter()
        .map(|item| match item.key.field("age") {
            Some(FieldValue::Integer(age)) => *age,
            other => panic!("unexpected field {other:?}"),
        })
        .collect();
    assert_eq!(ages, vec![7, 40, 70]);
}

#[test]
fn unparsable_expression_is_refused_at_creation() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();

    let options = StoreOptions {
        is_primitive_key: false,
        cel_expression: "mapX.age <".to_string(),
        ..Default::default()
    };
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    assert!(matches!(
        db.new_store(&ctx, &tx, "broken", options, None),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn duplicate_composite_keys_in_non_unique_store() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new();
    let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();

    let options = StoreOptions {
        is_primitive_key: false,
        is_unique: false,
        ..Default::default()
    };
    let tx = db
        .begin_transaction(&ctx, TransactionOptions::writing())
        .unwrap();
    let store = db
        .new_store(&ctx, &tx, "dups", options, Some(employee_spec()))
        .unwrap();
    let key = employee("US", "Eng", 7);
    store
        .add(
            &ctx,
            &[
                Item::new(key.clone(), "first"),
                Item::new(key.clone(), "second"),
            ],
        )
        .unwrap();
    assert_eq!(store.count().unwrap(), 2);

    // Both items are reachable in deterministic (item id) order.
    assert!(store.find(&ctx, &key).unwrap());
    let items = store.get_items(&ctx, PagingInfo::forward(10)).unwrap();
    assert_eq!(items.len(), 2);
    assert!(items[0].id < items[1].id);

    // find_with_id picks an exact duplicate.
    store.find_with_id(&ctx, &key, items[1].id).unwrap();
    let exact = store.current_item(&ctx).unwrap().unwrap();
    assert_eq!(exact.id, items[1].id);
}
