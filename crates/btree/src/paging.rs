//! Paging parameters for bulk fetches.

use serde::{Deserialize, Serialize};

/// Which way a paged fetch walks the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingDirection {
    #[default]
    Forward,
    Backward,
}

/// How to walk and fetch: skip `page_offset` pages of `page_size` from the
/// cursor, then return `fetch_count` items (or `page_size` when zero).
/// Walks clamp at the tree ends; a short page is a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingInfo {
    pub page_offset: usize,
    pub page_size: usize,
    pub fetch_count: usize,
    pub direction: PagingDirection,
}

impl Default for PagingInfo {
    fn default() -> Self {
        PagingInfo {
            page_offset: 0,
            page_size: 20,
            fetch_count: 0,
            direction: PagingDirection::Forward,
        }
    }
}

impl PagingInfo {
    pub fn forward(page_size: usize) -> Self {
        PagingInfo {
            page_size,
            ..Default::default()
        }
    }

    pub fn backward(page_size: usize) -> Self {
        PagingInfo {
            page_size,
            direction: PagingDirection::Backward,
            ..Default::default()
        }
    }

    /// Items to skip before fetching.
    pub fn skip(&self) -> usize {
        self.page_offset.saturating_mul(self.page_size)
    }

    /// Items to return: `fetch_count` when set, capped by `page_size`.
    pub fn take(&self) -> usize {
        if self.fetch_count > 0 {
            self.fetch_count.min(self.page_size)
        } else {
            self.page_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fetch_one_page_of_twenty() {
        let p = PagingInfo::default();
        assert_eq!(p.skip(), 0);
        assert_eq!(p.take(), 20);
        assert_eq!(p.direction, PagingDirection::Forward);
    }

    #[test]
    fn fetch_count_overrides_page_size() {
        let mut p = PagingInfo::forward(10);
        p.fetch_count = 3;
        assert_eq!(p.take(), 3);
        p.page_offset = 2;
        assert_eq!(p.skip(), 20);
    }
}
