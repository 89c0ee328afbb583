#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use wikidb::schema::apply_schema;
use wikidb::{
    AttrMap, Backend, BackendConfig, DbmBackend, Dsn, PageIterator, SqlDriver, SqliteBackend,
    SqliteDriver, Value, VersionData,
};

/// An in-memory SQL backend.
pub fn sql_backend() -> SqliteBackend {
    SqliteBackend::open_in_memory("").expect("open in-memory sql backend")
}

/// A DBM backend in a fresh directory. Keep the `TempDir` alive.
pub fn dbm_backend() -> (TempDir, DbmBackend) {
    let dir = TempDir::new().expect("create temp dir");
    let backend = DbmBackend::open(&BackendConfig::dbm(dir.path())).expect("open dbm backend");
    (dir, backend)
}

/// A SQLite file with the schema applied, and its config.
pub fn sql_file(dir: &Path, prefix: &str) -> BackendConfig {
    let dsn = format!("sqlite://{}", dir.join("wiki.db").display());
    let driver = SqliteDriver::connect(&Dsn::parse(&dsn).expect("parse dsn"), Duration::from_secs(5))
        .expect("connect");
    apply_schema(&driver, prefix).expect("apply schema");
    BackendConfig::sql(dsn).with_prefix(prefix)
}

/// Runs `check` against both engines.
pub fn on_both(check: impl Fn(&mut dyn Backend)) {
    let mut sql = sql_backend();
    check(&mut sql);

    let (_dir, mut dbm) = dbm_backend();
    check(&mut dbm);
}

/// A major revision without attributes.
pub fn rev(mtime: i64, content: &str) -> VersionData {
    VersionData::new(mtime, content)
}

/// A revision by `author`.
pub fn rev_by(mtime: i64, content: &str, author: &str) -> VersionData {
    VersionData::new(mtime, content).with_attr("author", author)
}

pub fn attrs(pairs: &[(&str, Value)]) -> AttrMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

pub fn links(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

pub fn names(iter: PageIterator) -> Vec<String> {
    iter.pagenames()
}

/// Version numbers of a page, newest first.
pub fn versions(backend: &dyn Backend, pagename: &str) -> Vec<u32> {
    let mut out = Vec::new();
    let mut v = backend.get_latest_version(pagename).expect("latest version");
    while v > 0 {
        out.push(v);
        v = backend.get_previous_version(pagename, v).expect("previous version");
    }
    out
}

pub fn engine_msg(backend: &dyn Backend, what: &str) -> String {
    format!("[{}] {what}", backend.engine())
}
