//! # Page Iterator
//!
//! Query operations (`get_all_pages`, `get_links`, `text_search`,
//! `most_popular`, `most_recent`) return a [`PageIterator`].
//!
//! ## Why Buffer?
//!
//! Both engines materialize the full result before handing out the iterator.
//! For SQL this means the statement is finished (and its read lock dropped)
//! before the caller starts consuming rows, so a caller that writes while
//! iterating can't deadlock against its own cursor. For DBM the result is
//! the product of a full scan anyway.
//!
//! `count()` is therefore always known, but callers should still treat it as
//! optional, hence the `Option`.
//!
//! `PageIterator` is not itself an [`Iterator`]: `Iterator::count` consumes
//! the iterator and would shadow the row-count accessor. Use `next()`
//! directly, or `into_iter()` for adapter chains.

use std::collections::VecDeque;

use crate::types::PageRecord;

/// A forward-only, single-pass cursor over query results.
#[derive(Debug, Default)]
pub struct PageIterator {
    rows: VecDeque<PageRecord>,
    total: usize,
    freed: bool,
}

impl PageIterator {
    /// Wraps a fully materialized result set.
    pub fn new(rows: Vec<PageRecord>) -> Self {
        let total = rows.len();
        Self {
            rows: rows.into(),
            total,
            freed: false,
        }
    }

    /// An iterator with no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total number of rows in the result, independent of how many have
    /// been consumed. `None` after [`PageIterator::free`].
    pub fn count(&self) -> Option<usize> {
        if self.freed {
            None
        } else {
            Some(self.total)
        }
    }

    /// Releases the remaining rows. Safe to call more than once; `next`
    /// returns `None` afterwards.
    pub fn free(&mut self) {
        self.rows.clear();
        self.freed = true;
    }

    /// The next row, or `None` at the end.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<PageRecord> {
        self.rows.pop_front()
    }

    /// Collects the remaining page names.
    pub fn pagenames(self) -> Vec<String> {
        self.into_iter().map(|r| r.pagename).collect()
    }
}

impl IntoIterator for PageIterator {
    type Item = PageRecord;
    type IntoIter = std::collections::vec_deque::IntoIter<PageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
