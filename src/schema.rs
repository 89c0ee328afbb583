//! # SQL Schema for wikidb
//!
//! This module defines the tables used by the SQL backend and the session
//! store, and the two operations on them: [`apply_schema`] (run out-of-band,
//! by `wikidb-admin init-schema` or by tests) and [`verify_schema`] (run by
//! [`SqlBackend::open`](crate::sql::SqlBackend::open), which never creates
//! tables on its own).
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  page                 version                  link                     │
//! │  ┌──────────────┐     ┌────────────────┐       ┌──────────────┐         │
//! │  │ id (PK)      │◄────│ id             │       │ linkfrom ────┼──► page │
//! │  │ pagename (U) │     │ version        │       │ linkto   ────┼──► page │
//! │  │ hits         │     │ mtime          │       └──────────────┘         │
//! │  │ pagedata     │     │ minor_edit     │                                │
//! │  └──────────────┘     │ content        │                                │
//! │        ▲              │ versiondata    │                                │
//! │        │              └────────────────┘                                │
//! │  recent (derived)             nonempty (derived)      session           │
//! │  ┌────────────────┐           ┌──────────┐            ┌────────────┐    │
//! │  │ id (PK)        │           │ id (PK)  │            │ sess_id    │    │
//! │  │ latestversion  │           └──────────┘            │ sess_data  │    │
//! │  │ latestmajor    │                                   │ sess_date  │    │
//! │  │ latestminor    │                                   │ sess_ip    │    │
//! │  └────────────────┘                                   └────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every table and index name carries the configured prefix. The DDL below
//! uses a `{prefix}` placeholder, substituted by [`ddl`].
//!
//! ## Why Derived Tables?
//!
//! `recent` and `nonempty` could be computed from `version` on every query,
//! but "latest version of every page" is the hot path of page listings and
//! recent changes. They are rewritten in the same lock scope as every
//! version insert or delete.

use crate::config::validate_prefix;
use crate::driver::{value_string, SqlDriver, SqlValue};
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a database with a different version is rejected
/// by [`verify_schema`].
pub const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `page` table.
///
/// # Columns
///
/// - `id`: surrogate key. `AUTOINCREMENT` guarantees that an id is never
///   handed out twice, even after the page with the highest id is deleted
/// - `pagename`: unique, case-sensitive
/// - `hits`: view counter, updated without touching `pagedata`
/// - `pagedata`: encoded attribute map, `''` when empty
const CREATE_PAGE: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}page (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    pagename TEXT NOT NULL UNIQUE,
    hits     INTEGER NOT NULL DEFAULT 0,
    pagedata TEXT NOT NULL DEFAULT ''
)
"#;

/// The `version` table: one row per revision.
///
/// `content = ''` means the page was deleted as of this revision.
const CREATE_VERSION: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}version (
    id          INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    mtime       INTEGER NOT NULL,
    minor_edit  INTEGER NOT NULL DEFAULT 0,
    content     TEXT NOT NULL DEFAULT '',
    versiondata TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (id, version)
)
"#;

/// Recent changes are ordered by `mtime`.
const CREATE_VERSION_MTIME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {prefix}version_mtime ON {prefix}version(mtime)
"#;

/// Derived: latest overall/major/minor version number per page.
const CREATE_RECENT: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}recent (
    id            INTEGER PRIMARY KEY,
    latestversion INTEGER,
    latestmajor   INTEGER,
    latestminor   INTEGER
)
"#;

/// Derived: pages whose latest version has content.
const CREATE_NONEMPTY: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}nonempty (
    id INTEGER PRIMARY KEY
)
"#;

/// Link edges by page id. No primary key: `set_links` deduplicates.
const CREATE_LINK: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}link (
    linkfrom INTEGER NOT NULL,
    linkto   INTEGER NOT NULL
)
"#;

/// Outgoing links (`get_links`, `set_links`).
const CREATE_LINK_FROM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {prefix}link_from ON {prefix}link(linkfrom)
"#;

/// Backlinks (`get_links(.., reversed)`, placeholder checks).
const CREATE_LINK_TO_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {prefix}link_to ON {prefix}link(linkto)
"#;

/// HTTP sessions, see [`SqlSessionStore`](crate::session::SqlSessionStore).
const CREATE_SESSION: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}session (
    sess_id   TEXT PRIMARY KEY,
    sess_data BLOB NOT NULL,
    sess_date INTEGER NOT NULL,
    sess_ip   TEXT NOT NULL DEFAULT ''
)
"#;

/// Session garbage collection scans by date.
const CREATE_SESSION_DATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {prefix}session_date ON {prefix}session(sess_date)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}wikidb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// All DDL, in creation order.
const ALL_DDL: &[&str] = &[
    CREATE_METADATA,
    CREATE_PAGE,
    CREATE_VERSION,
    CREATE_VERSION_MTIME_INDEX,
    CREATE_RECENT,
    CREATE_NONEMPTY,
    CREATE_LINK,
    CREATE_LINK_FROM_INDEX,
    CREATE_LINK_TO_INDEX,
    CREATE_SESSION,
    CREATE_SESSION_DATE_INDEX,
];

/// Base names of the tables the page backend needs.
pub const BACKEND_TABLES: &[&str] = &["page", "version", "recent", "nonempty", "link"];

/// Base name of the session table.
pub const SESSION_TABLE: &str = "session";

/// Substitutes the prefix into a DDL template.
pub fn ddl(template: &str, prefix: &str) -> String {
    template.replace("{prefix}", prefix)
}

/// The full schema script for `prefix`, as printed by
/// `wikidb-admin init-schema --print`.
pub fn schema_script(prefix: &str) -> String {
    ALL_DDL
        .iter()
        .map(|stmt| format!("{};\n", ddl(stmt, prefix).trim()))
        .collect()
}

// =============================================================================
// Apply / Verify
// =============================================================================

/// Creates every table and index (idempotent) and records the schema version.
///
/// # Errors
///
/// - [`Error::Config`] for an invalid prefix
/// - [`Error::Schema`] if the database already has a different schema version
pub fn apply_schema<D: SqlDriver + ?Sized>(driver: &D, prefix: &str) -> Result<()> {
    validate_prefix(prefix)?;
    for stmt in ALL_DDL {
        driver.execute_batch(&ddl(stmt, prefix))?;
    }
    verify_or_set_version(driver, prefix)
}

/// Checks that the tables in `required` exist and the schema version matches.
///
/// # Errors
///
/// [`Error::Schema`] naming the first missing table.
pub fn verify_schema<D: SqlDriver + ?Sized>(driver: &D, prefix: &str, required: &[&str]) -> Result<()> {
    validate_prefix(prefix)?;
    let existing = driver.table_names()?;
    for base in required {
        let table = format!("{prefix}{base}");
        if !existing.iter().any(|t| t == &table) {
            return Err(Error::Schema(format!(
                "table '{table}' does not exist; run `wikidb-admin init-schema` first"
            )));
        }
    }
    if existing.iter().any(|t| *t == format!("{prefix}wikidb_metadata")) {
        if let Some(version) = stored_version(driver, prefix)? {
            check_version(version)?;
        }
    }
    Ok(())
}

fn stored_version<D: SqlDriver + ?Sized>(driver: &D, prefix: &str) -> Result<Option<i32>> {
    let value = driver.query_value(
        &format!("SELECT value FROM {prefix}wikidb_metadata WHERE key = 'schema_version'"),
        &[],
    )?;
    // Unparseable versions read as 0 and fail the comparison.
    Ok(value.map(|v| value_string(&v).parse().unwrap_or(0)))
}

fn check_version(version: i32) -> Result<()> {
    if version != SCHEMA_VERSION {
        return Err(Error::Schema(format!(
            "schema version mismatch: database has version {version}, but this wikidb version requires {SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

/// Reads the schema version, setting it if this is a new database.
fn verify_or_set_version<D: SqlDriver + ?Sized>(driver: &D, prefix: &str) -> Result<()> {
    match stored_version(driver, prefix)? {
        None => {
            driver.execute(
                &format!("INSERT INTO {prefix}wikidb_metadata (key, value) VALUES ('schema_version', ?1)"),
                &[SqlValue::Text(SCHEMA_VERSION.to_string())],
            )?;
            Ok(())
        }
        Some(version) => check_version(version),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDriver;

    #[test]
    fn test_apply_creates_prefixed_tables() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        apply_schema(&driver, "wiki_").unwrap();

        let tables = driver.table_names().unwrap();
        for base in BACKEND_TABLES.iter().chain(std::iter::once(&SESSION_TABLE)) {
            assert!(tables.contains(&format!("wiki_{base}")), "missing wiki_{base}");
        }
        verify_schema(&driver, "wiki_", BACKEND_TABLES).unwrap();
    }

    #[test]
    fn test_apply_is_idempotent() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        apply_schema(&driver, "").unwrap();
        apply_schema(&driver, "").unwrap();
        verify_schema(&driver, "", BACKEND_TABLES).unwrap();
    }

    #[test]
    fn test_verify_reports_missing_tables() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let err = verify_schema(&driver, "", BACKEND_TABLES).unwrap_err();
        assert!(matches!(err, Error::Schema(msg) if msg.contains("'page'")));

        // Another prefix's tables don't count.
        apply_schema(&driver, "other_").unwrap();
        assert!(verify_schema(&driver, "", BACKEND_TABLES).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        apply_schema(&driver, "").unwrap();
        driver
            .execute("UPDATE wikidb_metadata SET value = '99' WHERE key = 'schema_version'", &[])
            .unwrap();
        assert!(matches!(verify_schema(&driver, "", BACKEND_TABLES), Err(Error::Schema(_))));
    }

    #[test]
    fn test_bad_prefix_rejected() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        assert!(matches!(apply_schema(&driver, "x;--"), Err(Error::Config(_))));
    }

    #[test]
    fn test_schema_script() {
        let script = schema_script("w_");
        assert!(script.contains("CREATE TABLE IF NOT EXISTS w_page"));
        assert!(script.contains("ON w_link(linkto);"));
        assert!(!script.contains("{prefix}"));
    }
}
