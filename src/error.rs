//! # Error Handling for wikidb
//!
//! This module defines the error types used throughout wikidb. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which keeps
//! the [`Backend`](crate::backend::Backend) trait signatures simple: every
//! operation returns [`Result<T>`].
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Fatal | Lock timeout, unreadable file, bad DSN, missing schema | Abort the request |
//! | Recoverable | A single key/value write rejected by the store | Log, retry or report |
//! | Caller | Empty pagename, `mtime` of zero, rename onto a live page | Fix the call |
//! | Conflict | Someone saved the same version first | Re-read and retry |
//!
//! ## Not-Found Is Not an Error
//!
//! A missing page or version is reported as `Ok(None)`, never as an `Err`.
//! The distinction between "no row" and "row with empty data" drives the
//! placeholder-page logic, so it is carried in the return type instead.

use std::path::PathBuf;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in wikidb operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Fatal: the store could not be opened at all
    // =========================================================================

    /// Another process held the store's lock file for the whole timeout.
    ///
    /// # When This Happens
    ///
    /// [`KvStore::open`](crate::kvstore::KvStore::open) in write mode polls the
    /// lock file once per second. When `timeout_secs` polls have failed, the
    /// open gives up with this error.
    #[error("{path}: could not acquire lock within {timeout_secs}s")]
    LockTimeout {
        /// The data file whose lock could not be taken
        path: PathBuf,
        /// The configured timeout
        timeout_secs: u64,
    },

    /// The store file could not be opened, created or read.
    #[error("{path}: open failed: {source}")]
    StoreOpen {
        /// The data file
        path: PathBuf,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The SQL database could not be reached.
    ///
    /// The `dsn` field is always redacted: passwords are replaced with
    /// `XXXXXXXX` before the error is constructed.
    #[error("can't connect to database {dsn}: {reason}")]
    Connect {
        /// Redacted connection string
        dsn: String,
        /// What went wrong
        reason: String,
    },

    /// The SQL schema is missing or incomplete.
    ///
    /// The backend never creates tables on its own; apply the DDL with
    /// `wikidb-admin init-schema` first.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration (unknown backend kind, bad prefix, ...).
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Recoverable: a single store operation failed
    // =========================================================================

    /// A single-key operation was rejected by the key/value store.
    ///
    /// These are logged as warnings where they happen. The store itself stays
    /// usable; the caller decides whether to retry.
    #[error("store {op}({key}) failed: {reason}")]
    Store {
        /// Operation name (`insert`, `replace`, `delete`, ...)
        op: &'static str,
        /// The key involved, lossily decoded for display
        key: String,
        /// Why it failed
        reason: String,
    },

    /// SQLite operation failed.
    ///
    /// Inside a lock scope this poisons the scope, so the outermost unlock
    /// rolls the whole sequence back instead of committing half of it.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Low-level I/O failure after the store was opened.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored blob could not be decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    // =========================================================================
    // Caller errors
    // =========================================================================

    /// The arguments violate the data model (empty pagename, version 0, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic concurrency conflict while creating a revision.
    ///
    /// # When This Happens
    ///
    /// [`WikiDb::create_revision`](crate::wikidb::WikiDb::create_revision) expects
    /// the new version to be exactly `latest + 1`. If another process saved in
    /// between, the numbers won't line up.
    ///
    /// # Recovery
    ///
    /// Re-read the page, re-apply the edit, and retry with the new version.
    #[error("conflict on page '{pagename}': expected version {expected}, but latest is {actual}")]
    Conflict {
        /// The page being saved
        pagename: String,
        /// The version number the caller tried to create
        expected: u32,
        /// The version that is current in the store
        actual: u32,
    },

    /// Rename target already holds a page with content.
    #[error("page '{pagename}' already exists")]
    PageExists {
        /// The occupied name
        pagename: String,
    },

    /// The retention path tried to merge away the current revision.
    #[error("attempt to merge most recent revision {version} of '{pagename}'")]
    LatestRevision {
        /// The page
        pagename: String,
        /// Its current version
        version: u32,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for errors that mean "the store is unusable".
    ///
    /// Callers in request handlers abort on these and keep going on the rest.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::StoreOpen { .. }
                | Self::Connect { .. }
                | Self::Schema(_)
                | Self::Config(_)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
