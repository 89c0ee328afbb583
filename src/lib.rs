//! # wikidb - Page and Revision Storage for a Wiki
//!
//! wikidb stores wiki pages, their revision history and the link graph
//! between them. It provides:
//!
//! - **One backend contract, two engines**: a key/value file engine (DBM)
//!   and a relational engine (SQL, SQLite via `rusqlite`)
//! - **Derived indexes**: latest/major/minor pointers and the set of
//!   non-empty pages, maintained on every version write
//! - **Revision retention**: a pure expiry planner with merge-on-purge for
//!   runs of minor edits
//! - **Sessions**: a small session store next to the page store
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       WikiDb (facade)                           │
//! │        create_revision, merge_revision, expire_page/all         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Box<dyn Backend>
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Backend (trait)                              │
//! │    pages, versions, links, queries, reentrant lock              │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │         DbmBackend            │ │     SqlBackend<SqlDriver>     │
//! │  one record per page          │ │  page/version/link/recent/    │
//! │  ┌─────────────────────────┐  │ │  nonempty tables              │
//! │  │ KvStore (log + index)   │  │ │  ┌─────────────────────────┐  │
//! │  └─────────────────────────┘  │ │  │ SqliteDriver (rusqlite) │  │
//! └───────────────────────────────┘ │  └─────────────────────────┘  │
//!                                   └───────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Stable ids**: a page's id survives renames and is never reused
//! 2. **Derived indexes follow versions**: RecentIndex and NonEmptyIndex are
//!    rewritten in the same lock scope as the version change
//! 3. **The current revision is never expired**
//! 4. **Link integrity**: a page row that other pages link to is demoted to
//!    a placeholder instead of being removed
//!
//! ## Module Organization
//!
//! - [`error`]: the error enum
//! - [`types`]: domain types (PageData, VersionData, AttrMap, ...)
//! - [`codec`]: blob encodings
//! - [`config`]: backend configuration and DSN parsing
//! - [`kvstore`]: the key/value file
//! - [`backend`]: the Backend trait and the reentrant lock
//! - [`iterator`]: query result cursor
//! - [`dbm`], [`sql`]: the two engines; [`driver`], [`schema`] support SQL
//! - [`search`]: text search queries
//! - [`retention`]: the expiry planner
//! - [`wikidb`]: the facade
//! - [`session`]: session stores
//!
//! ## Example
//!
//! ```
//! use wikidb::{AttrMap, Backend, RetentionPolicy, SqliteBackend, WikiDb};
//!
//! let backend = SqliteBackend::open_in_memory("")?;
//! let mut wiki = WikiDb::with_backend(Box::new(backend), RetentionPolicy::default());
//! wiki.create_revision("HomePage", 1, "Welcome!", &AttrMap::new(), &[], 1_700_000_000)?;
//! assert!(wiki.backend().is_wiki_page("HomePage")?);
//! # Ok::<(), wikidb::Error>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for wikidb operations.
///
/// A single error enum; open-time failures are fatal, single-key store
/// failures are recoverable.
pub mod error;

/// Domain types shared by every backend.
pub mod types;

/// Encoding of attribute maps, DBM page records and session values.
pub mod codec;

/// Backend configuration, DSN parsing, environment loading.
pub mod config;

/// An ordered, crash-tolerant key/value file with an exclusive lock.
pub mod kvstore;

/// The storage contract both engines implement.
///
/// See [`backend::Backend`] and [`backend::open_backend`].
pub mod backend;

/// Forward-only cursor over query results.
pub mod iterator;

/// The DBM engine: one key/value record per page.
pub mod dbm;

/// The `SqlDriver` capability trait and its SQLite implementation.
pub mod driver;

/// SQL DDL and schema verification.
pub mod schema;

/// The SQL engine.
pub mod sql;

/// Search query parsing and evaluation.
pub mod search;

/// Revision retention planning.
///
/// [`retention::plan_expiry`] is pure; [`wikidb::WikiDb`] applies its plans.
pub mod retention;

/// The wiki facade: revision creation, merging and expiry.
pub mod wikidb;

/// Web session storage.
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{open_backend, with_lock, Backend};
pub use config::{BackendConfig, BackendKind, DbmHandler, Dsn};
pub use dbm::DbmBackend;
pub use driver::{SqlDriver, SqliteDriver};
pub use error::{Error, Result};
pub use iterator::PageIterator;
pub use retention::{ExpireParams, RetentionPolicy};
pub use search::TextQuery;
pub use session::{open_session_store, SessionContext, SessionInfo, SessionStore};
pub use sql::{SqlBackend, SqliteBackend};
pub use wikidb::{ExpiryReport, WikiDb};

pub use types::{
    AttrMap, Content, PageData, PageId, PageRecord, RecentPointers, RecentQuery, SortBy,
    SortField, Value, VersionData,
};
