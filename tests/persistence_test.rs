//! Durability: reopening stores, torn writes, compaction, on-disk SQL.

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::Duration;

use common::{attrs, links, rev, rev_by, sql_file, versions};
use tempfile::TempDir;
use wikidb::kvstore::lock_path;
use wikidb::{
    open_backend, Backend, BackendConfig, DbmBackend, Error, RetentionPolicy, SqliteBackend, Value,
    WikiDb,
};

fn write_sample(db: &mut dyn Backend) {
    db.set_versiondata("HomePage", 1, &rev_by(100, "welcome", "alice")).unwrap();
    db.set_versiondata("HomePage", 2, &rev(200, "welcome back").minor(true)).unwrap();
    db.set_links("HomePage", &links(&["SandBox"])).unwrap();
    db.update_pagedata("HomePage", &attrs(&[("owner", "alice".into())])).unwrap();
    db.update_pagedata("HomePage", &attrs(&[("hits", Value::Int(3))])).unwrap();
}

fn assert_sample(db: &dyn Backend) {
    assert_eq!(versions(db, "HomePage"), vec![2, 1]);
    let v2 = db.get_versiondata("HomePage", 2, true).unwrap().unwrap();
    assert_eq!(v2.content.text(), Some("welcome back"));
    assert!(v2.is_minor_edit);
    let data = db.get_pagedata("HomePage").unwrap().unwrap();
    assert_eq!(data.hits, 3);
    assert_eq!(data.get("owner"), Some(&Value::from("alice")));
    assert_eq!(db.get_links("SandBox", true).unwrap().pagenames(), vec!["HomePage"]);
    assert!(!db.is_wiki_page("SandBox").unwrap());
    assert!(db.check().unwrap().is_empty());
}

// =============================================================================
// DBM
// =============================================================================

#[test]
fn test_dbm_reopen() {
    let dir = TempDir::new().unwrap();
    let config = BackendConfig::dbm(dir.path());

    let mut db = DbmBackend::open(&config).unwrap();
    write_sample(&mut db);
    db.close().unwrap();
    drop(db);

    let db = DbmBackend::open(&config).unwrap();
    assert_sample(&db);
}

#[test]
fn test_dbm_torn_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    let config = BackendConfig::dbm(dir.path());
    let path = config.dbm_path("pagedb").unwrap();

    {
        let mut db = DbmBackend::open(&config).unwrap();
        write_sample(&mut db);
    }
    let good_len = fs::metadata(&path).unwrap().len();

    // A record cut off mid-write.
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xde, 0xad, 0xbe, 0xef, 1, 9, 0]).unwrap();
    drop(file);

    {
        let mut db = DbmBackend::open(&config).unwrap();
        assert_sample(&db);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        db.set_versiondata("SandBox", 1, &rev(300, "play")).unwrap();
    }

    let db = DbmBackend::open(&config).unwrap();
    assert!(db.is_wiki_page("SandBox").unwrap());
    assert_eq!(versions(&db, "HomePage"), vec![2, 1]);
}

#[test]
fn test_dbm_optimize_compacts() {
    let dir = TempDir::new().unwrap();
    let config = BackendConfig::dbm(dir.path());
    let path = config.dbm_path("pagedb").unwrap();

    let mut db = DbmBackend::open(&config).unwrap();
    write_sample(&mut db);
    for hits in 0..50 {
        db.update_pagedata("HomePage", &attrs(&[("hits", Value::Int(hits))])).unwrap();
    }
    db.update_pagedata("HomePage", &attrs(&[("hits", Value::Int(3))])).unwrap();
    db.sync().unwrap();
    let before = fs::metadata(&path).unwrap().len();

    db.optimize().unwrap();
    let after = fs::metadata(&path).unwrap().len();
    assert!(after < before, "optimize should shrink {before} bytes, got {after}");
    assert_sample(&db);

    drop(db);
    let db = DbmBackend::open(&config).unwrap();
    assert_sample(&db);
}

#[test]
fn test_dbm_leftover_lock_file_does_not_block_open() {
    let dir = TempDir::new().unwrap();
    let config = BackendConfig::dbm(dir.path()).with_lock_timeout(Duration::ZERO);
    let path = config.dbm_path("pagedb").unwrap();

    // A writer that died without cleaning up.
    fs::write(lock_path(&path), "12345\n").unwrap();
    let mut db = DbmBackend::open(&config).unwrap();
    write_sample(&mut db);

    // A live holder still excludes other writers.
    let err = DbmBackend::open(&config).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(err.is_fatal());

    db.close().unwrap();
    drop(db);
    let db = DbmBackend::open(&config).unwrap();
    assert_sample(&db);
}

#[test]
fn test_dbm_prefix_separates_wikis() {
    let dir = TempDir::new().unwrap();
    let first = BackendConfig::dbm(dir.path()).with_prefix("one_");
    let second = BackendConfig::dbm(dir.path()).with_prefix("two_");

    let mut a = DbmBackend::open(&first).unwrap();
    let b = DbmBackend::open(&second).unwrap();
    a.set_versiondata("Page", 1, &rev(10, "one")).unwrap();

    assert!(a.is_wiki_page("Page").unwrap());
    assert!(!b.is_wiki_page("Page").unwrap());
    assert!(dir.path().join("one_pagedb.gdbm").exists());
    assert!(dir.path().join("two_pagedb.gdbm").exists());
}

// =============================================================================
// SQL
// =============================================================================

#[test]
fn test_sql_file_reopen() {
    let dir = TempDir::new().unwrap();
    let config = sql_file(dir.path(), "wiki_");

    let mut db = open_backend(&config).unwrap();
    write_sample(db.as_mut());
    db.close().unwrap();
    drop(db);

    let db = open_backend(&config).unwrap();
    assert_eq!(db.engine(), "sql");
    assert_sample(db.as_ref());
}

#[test]
fn test_sql_requires_schema_for_prefix() {
    let dir = TempDir::new().unwrap();
    let config = sql_file(dir.path(), "wiki_");
    let BackendConfig { kind, .. } = config;
    let unprefixed = BackendConfig {
        kind,
        ..BackendConfig::sql("")
    };

    let err = open_backend(&unprefixed).err().expect("open_backend should fail");
    assert!(matches!(err, Error::Schema(_)), "got {err}");
    assert!(err.is_fatal());
}

#[test]
fn test_sql_failed_scope_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let config = sql_file(dir.path(), "");

    {
        let mut db = open_backend(&config).unwrap();
        db.set_versiondata("Taken", 1, &rev(10, "taken")).unwrap();
        db.set_versiondata("Draft", 1, &rev(10, "draft")).unwrap();
        assert!(matches!(db.rename_page("Draft", "Taken"), Err(Error::PageExists { .. })));
    }

    let db = open_backend(&config).unwrap();
    assert!(db.is_wiki_page("Draft").unwrap());
    assert_eq!(db.get_all_pagenames().unwrap(), vec!["Draft", "Taken"]);
}

#[test]
fn test_wikidb_over_sql_file() {
    let dir = TempDir::new().unwrap();
    let config = sql_file(dir.path(), "");

    let mut wiki = WikiDb::open(&config).unwrap();
    wiki.set_policy(RetentionPolicy::keep_all());
    wiki.create_revision("HomePage", 1, "hello", &attrs(&[]), &[], 1_000).unwrap();
    wiki.close().unwrap();

    let db = open_backend(&config).unwrap();
    assert_eq!(
        db.get_versiondata("HomePage", 1, true).unwrap().unwrap().content.text(),
        Some("hello")
    );
}

#[test]
fn test_in_memory_sql_is_private() {
    let mut a = SqliteBackend::open_in_memory("").unwrap();
    let b = SqliteBackend::open_in_memory("").unwrap();
    a.set_versiondata("Page", 1, &rev(10, "x")).unwrap();
    assert!(!b.is_wiki_page("Page").unwrap());
}
