//! # The Backend Contract
//!
//! Every storage engine implements [`Backend`]. Callers (the wiki facade,
//! the admin tool, the tests) only ever see `dyn Backend`; the engine is
//! picked once by [`open_backend`].
//!
//! ## Ownership Model
//!
//! ```text
//! reads   (&self)      is_wiki_page, get_*, text_search, most_*
//! writes  (&mut self)  set_*, update_*, delete_*, rename_page, lock/unlock
//! ```
//!
//! A backend instance is single-threaded. Several processes may share one
//! store; the reentrant lock is how they coordinate.
//!
//! ## Lock State Machine
//!
//! ```text
//! UNLOCKED ──lock──► LOCKED(1) ──lock──► LOCKED(2) ...
//!     ▲                  │                   │
//!     └────unlock────────┘◄──────unlock──────┘
//!
//! unlock(force = true): any depth ──► UNLOCKED
//! unlock while UNLOCKED: no-op
//! ```
//!
//! Only the outermost `lock`/`unlock` touch the engine (BEGIN/COMMIT for SQL,
//! sync for DBM). A failure inside a scope poisons it, and the outermost
//! release then rolls back instead of committing.

use tracing::warn;

use crate::config::{BackendConfig, BackendKind};
use crate::dbm::DbmBackend;
use crate::driver::SqliteDriver;
use crate::error::Result;
use crate::iterator::PageIterator;
use crate::search::TextQuery;
use crate::sql::SqlBackend;
use crate::types::{
    merge_attrs, AttrMap, PageData, PageId, RecentPointers, RecentQuery, SortBy, VersionData,
    ATTR_IS_MINOR_EDIT, ATTR_MTIME,
};

// =============================================================================
// Lock Counter
// =============================================================================

/// What a release did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The lock was not held.
    NotHeld,
    /// A nested scope ended; the lock is still held.
    Inner,
    /// The outermost scope ended. `commit` is false if the scope was poisoned.
    Outermost {
        /// Whether the work done under the lock should be kept.
        commit: bool,
    },
}

/// Reentrant lock bookkeeping shared by both engines.
///
/// # Rust Pattern: Plain State, Engine-Specific Effects
///
/// The counter only decides *when* something has to happen. The engine acts
/// on the returned value (`acquire() == true` means "really take the lock",
/// [`Release::Outermost`] means "really release it").
#[derive(Debug, Default, Clone)]
pub struct LockCounter {
    depth: u32,
    poisoned: bool,
}

impl LockCounter {
    /// Enters a scope. Returns true if this is the outermost one.
    pub fn acquire(&mut self) -> bool {
        self.depth += 1;
        self.depth == 1
    }

    /// Leaves a scope, or all of them with `force`.
    pub fn release(&mut self, force: bool) -> Release {
        if self.depth == 0 {
            return Release::NotHeld;
        }
        self.depth = if force { 0 } else { self.depth - 1 };
        if self.depth > 0 {
            return Release::Inner;
        }
        let commit = !self.poisoned;
        self.poisoned = false;
        Release::Outermost { commit }
    }

    /// Marks the current scope as failed. No effect when unlocked.
    pub fn poison(&mut self) {
        if self.depth > 0 {
            self.poisoned = true;
        }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Undoes an `acquire` whose engine-side lock could not be taken.
    pub fn abort_acquire(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.poisoned = false;
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// The storage contract shared by the DBM and SQL engines.
///
/// Not-found is `Ok(None)` / `Ok(0)` / an empty iterator, never an error.
/// Every operation taking a page name rejects the empty name with
/// [`Error::InvalidArgument`](crate::Error::InvalidArgument).
pub trait Backend {
    /// Short engine name (`"dbm"`, `"sql"`), for logs.
    fn engine(&self) -> &'static str;

    // =========================================================================
    // Pages
    // =========================================================================

    /// True if the page exists and its latest version has content.
    fn is_wiki_page(&self, pagename: &str) -> Result<bool>;

    /// Names of all non-empty pages, sorted.
    fn get_all_pagenames(&self) -> Result<Vec<String>>;

    /// Page metadata, or `None` if there is no row at all (placeholders
    /// return `Some` with blank data).
    fn get_pagedata(&self, pagename: &str) -> Result<Option<PageData>>;

    /// Merges attributes into the page's metadata, creating the row if needed.
    ///
    /// An update consisting of exactly the `hits` key takes a fast path: no
    /// lock cycle, and nothing happens if the row is missing.
    fn update_pagedata(&mut self, pagename: &str, update: &AttrMap) -> Result<()>;

    /// Removes versions, index entries and outgoing links. The row stays as a
    /// placeholder while other pages link to it.
    fn delete_page(&mut self, pagename: &str) -> Result<()>;

    /// Renames a page, keeping its id. Returns `None` if `from` has no row.
    ///
    /// # Errors
    ///
    /// [`Error::PageExists`](crate::Error::PageExists) if `to` is a page with
    /// content. A placeholder at `to` is absorbed: its incoming links are
    /// repointed to the renamed page.
    fn rename_page(&mut self, from: &str, to: &str) -> Result<Option<PageId>>;

    // =========================================================================
    // Versions
    // =========================================================================

    /// Highest version number, 0 if none.
    fn get_latest_version(&self, pagename: &str) -> Result<u32>;

    /// Highest version number strictly below `version`, 0 if none.
    fn get_previous_version(&self, pagename: &str, version: u32) -> Result<u32>;

    /// One version. With `want_content == false` the content is reported as
    /// [`Content::NonEmpty`](crate::types::Content::NonEmpty) or
    /// [`Content::Empty`](crate::types::Content::Empty).
    fn get_versiondata(
        &self,
        pagename: &str,
        version: u32,
        want_content: bool,
    ) -> Result<Option<VersionData>>;

    /// Writes (or replaces) a version and updates the derived indexes.
    fn set_versiondata(&mut self, pagename: &str, version: u32, data: &VersionData) -> Result<()>;

    /// Merges attributes into an existing version. `mtime` and
    /// `is_minor_edit` keys update the typed fields. No-op if the version
    /// does not exist.
    fn update_versiondata(&mut self, pagename: &str, version: u32, update: &AttrMap) -> Result<()> {
        with_lock(self, true, |backend| {
            let Some(mut data) = backend.get_versiondata(pagename, version, true)? else {
                return Ok(());
            };
            let mut rest = AttrMap::new();
            for (key, value) in update {
                match key.as_str() {
                    ATTR_MTIME => {
                        if let Some(mtime) = value.as_int().filter(|m| *m > 0) {
                            data.mtime = mtime;
                        }
                    }
                    ATTR_IS_MINOR_EDIT => data.is_minor_edit = value.as_bool(),
                    _ => {
                        rest.insert(key.clone(), value.clone());
                    }
                }
            }
            merge_attrs(&mut data.attrs, &rest);
            backend.set_versiondata(pagename, version, &data)
        })
    }

    /// Deletes one version and updates the derived indexes. No-op if missing.
    fn delete_versiondata(&mut self, pagename: &str, version: u32) -> Result<()>;

    /// The RecentIndex entry of a page.
    fn get_recent(&self, pagename: &str) -> Result<Option<RecentPointers>>;

    // =========================================================================
    // Links
    // =========================================================================

    /// Replaces the page's outgoing links. Targets that don't exist get
    /// placeholder rows; duplicates are ignored.
    fn set_links(&mut self, pagename: &str, links: &[String]) -> Result<()>;

    /// Outgoing links, or incoming links with `reversed`, sorted by name.
    fn get_links(&self, pagename: &str, reversed: bool) -> Result<PageIterator>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// All pages, or only non-empty ones unless `include_deleted`.
    fn get_all_pages(
        &self,
        include_deleted: bool,
        sortby: Option<SortBy>,
        limit: Option<usize>,
    ) -> Result<PageIterator>;

    /// Case-insensitive search over titles, or titles and latest content
    /// with `fullsearch`. Non-empty pages only, sorted by name.
    fn text_search(&self, query: &TextQuery, fullsearch: bool) -> Result<PageIterator>;

    /// Pages by hits, descending. A negative `limit` sorts ascending and
    /// returns `|limit|` rows; zero means the default of 20.
    fn most_popular(&self, limit: i64, sortby: Option<SortBy>) -> Result<PageIterator>;

    /// Recent changes, see [`RecentQuery`].
    fn most_recent(&self, query: &RecentQuery) -> Result<PageIterator>;

    // =========================================================================
    // Locking
    // =========================================================================

    /// Enters a lock scope. Only the outermost call locks the engine.
    fn lock(&mut self, write: bool) -> Result<()>;

    /// Leaves a lock scope, or all scopes with `force`.
    fn unlock(&mut self, force: bool) -> Result<()>;

    /// Marks the current scope as failed so the outermost unlock rolls back.
    fn poison_lock(&mut self);

    /// Current lock nesting depth.
    fn lock_depth(&self) -> u32;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Recomputes RecentIndex and NonEmptyIndex for every page.
    fn rebuild_indexes(&mut self) -> Result<()>;

    /// Describes index inconsistencies without fixing them. Empty if healthy.
    fn check(&self) -> Result<Vec<String>>;

    /// Flushes pending writes to disk.
    fn sync(&mut self) -> Result<()>;

    /// Compacts the underlying storage.
    fn optimize(&mut self) -> Result<()>;

    /// Releases the store. Force-unlocks first, warning if a scope was open.
    /// Further calls are no-ops.
    fn close(&mut self) -> Result<()>;
}

// =============================================================================
// Lock Scopes
// =============================================================================

/// Runs `f` inside a lock scope.
///
/// On error the scope is poisoned before unlocking, so the outermost release
/// rolls back. The closure's error wins over an unlock error.
pub fn with_lock<B, T>(backend: &mut B, write: bool, f: impl FnOnce(&mut B) -> Result<T>) -> Result<T>
where
    B: Backend + ?Sized,
{
    backend.lock(write)?;
    match f(backend) {
        Ok(value) => {
            backend.unlock(false)?;
            Ok(value)
        }
        Err(e) => {
            backend.poison_lock();
            if let Err(unlock_err) = backend.unlock(false) {
                warn!(error = %unlock_err, "unlock after failed lock scope also failed");
            }
            Err(e)
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Opens the backend described by `config`.
///
/// # Errors
///
/// Fatal open errors: [`Error::Config`](crate::Error::Config),
/// [`Error::LockTimeout`](crate::Error::LockTimeout),
/// [`Error::StoreOpen`](crate::Error::StoreOpen),
/// [`Error::Connect`](crate::Error::Connect),
/// [`Error::Schema`](crate::Error::Schema).
pub fn open_backend(config: &BackendConfig) -> Result<Box<dyn Backend>> {
    config.validate()?;
    match &config.kind {
        BackendKind::Dbm { .. } => Ok(Box::new(DbmBackend::open(config)?)),
        BackendKind::Sql { .. } => Ok(Box::new(SqlBackend::<SqliteDriver>::open(config)?)),
    }
}
