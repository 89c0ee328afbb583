//! # SQL Backend
//!
//! [`SqlBackend`] stores pages in five tables (see [`crate::schema`]) and
//! talks to the database through a [`SqlDriver`].
//!
//! ## Write Path
//!
//! ```text
//! set_versiondata("HomePage", 3, data)
//!   │
//!   ├─ lock(write)                         BEGIN IMMEDIATE (outermost only)
//!   ├─ page id (INSERT page if missing)
//!   ├─ DELETE version (id, 3)
//!   ├─ INSERT version (id, 3, ...)
//!   ├─ rebuild recent   for id
//!   ├─ rebuild nonempty for id
//!   └─ unlock                              COMMIT, or ROLLBACK if anything failed
//! ```
//!
//! ## Read Path
//!
//! Reads run without taking the lock. With WAL journaling a reader sees the
//! state before or after a write scope, never the middle of one.
//!
//! ## Page Ids
//!
//! `page.id` is `AUTOINCREMENT`; new ids are read back with
//! [`SqlDriver::last_insert_id`]. An id is never reused, so stale link rows
//! can't silently start pointing at an unrelated page.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::backend::{with_lock, Backend, LockCounter, Release};
use crate::codec::{decode_attrs, encode_attrs};
use crate::config::{BackendConfig, BackendKind, Dsn};
use crate::driver::{value_i64, value_string, SqlDriver, SqlRow, SqlValue, SqliteDriver};
use crate::error::{Error, Result};
use crate::iterator::PageIterator;
use crate::schema::{apply_schema, verify_schema, BACKEND_TABLES};
use crate::search::TextQuery;
use crate::types::{
    merge_attrs, validate_pagename, validate_version, AttrMap, Content, PageData, PageId,
    PageRecord, RecentPointers, RecentQuery, SortBy, SortField, VersionData, ATTR_HITS,
};

/// Default row count for `most_popular(0, ..)`.
const DEFAULT_POPULAR_LIMIT: i64 = 20;

static NULL: SqlValue = SqlValue::Null;

// =============================================================================
// Helpers
// =============================================================================

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn int(i: i64) -> SqlValue {
    SqlValue::Integer(i)
}

fn col(row: &SqlRow, i: usize) -> &SqlValue {
    row.get(i).unwrap_or(&NULL)
}

fn col_i64(row: &SqlRow, i: usize) -> i64 {
    value_i64(col(row, i)).unwrap_or(0)
}

fn col_version(row: &SqlRow, i: usize) -> Option<u32> {
    value_i64(col(row, i)).and_then(|v| u32::try_from(v).ok())
}

/// Prefixed table names.
#[derive(Debug, Clone)]
struct Tables {
    page: String,
    version: String,
    link: String,
    recent: String,
    nonempty: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            page: format!("{prefix}page"),
            version: format!("{prefix}version"),
            link: format!("{prefix}link"),
            recent: format!("{prefix}recent"),
            nonempty: format!("{prefix}nonempty"),
        }
    }
}

// =============================================================================
// SqlBackend
// =============================================================================

/// The relational [`Backend`].
#[derive(Debug)]
pub struct SqlBackend<D: SqlDriver> {
    driver: D,
    t: Tables,
    /// `page.id, page.pagename, page.hits, page.pagedata`
    page_fields: String,
    /// `version.version, version.mtime, version.minor_edit, version.content, version.versiondata`
    version_fields: String,
    lock: LockCounter,
    closed: bool,
}

impl<D: SqlDriver> SqlBackend<D> {
    /// Connects using `config`, which must describe a SQL backend.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for a non-SQL config or a bad DSN
    /// - [`Error::Connect`] if the database can't be reached
    /// - [`Error::Schema`] if the tables haven't been created
    pub fn open(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let BackendKind::Sql { dsn } = &config.kind else {
            return Err(Error::Config("not a sql backend configuration".into()));
        };
        let dsn = Dsn::parse(dsn)?;
        let driver = D::connect(&dsn, config.lock_timeout)?;
        let backend = Self::with_driver(driver, &config.prefix)?;
        info!(dsn = %dsn, prefix = %config.prefix, "opened sql backend");
        Ok(backend)
    }

    /// Wraps an existing connection whose schema is already in place.
    pub fn with_driver(driver: D, prefix: &str) -> Result<Self> {
        verify_schema(&driver, prefix, BACKEND_TABLES)?;
        let t = Tables::new(prefix);
        let page_fields = format!(
            "{p}.id, {p}.pagename, {p}.hits, {p}.pagedata",
            p = t.page
        );
        let version_fields = format!(
            "{v}.version, {v}.mtime, {v}.minor_edit, {v}.content, {v}.versiondata",
            v = t.version
        );
        Ok(Self {
            driver,
            t,
            page_fields,
            version_fields,
            lock: LockCounter::default(),
            closed: false,
        })
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Looks up a page id, inserting the page row when `create` is set.
    fn get_pageid(&mut self, pagename: &str, create: bool) -> Result<Option<PageId>> {
        if let Some(id) = self.lookup_pageid(pagename)? {
            return Ok(Some(id));
        }
        if !create {
            return Ok(None);
        }
        with_lock(self, true, |b| {
            b.driver.execute(
                &format!(
                    "INSERT INTO {} (pagename, hits, pagedata) VALUES (?1, 0, '')",
                    b.t.page
                ),
                &[text(pagename)],
            )?;
            let id = PageId::from_raw(b.driver.last_insert_id());
            debug!(pagename, id = %id, "created page row");
            Ok(Some(id))
        })
    }

    fn lookup_pageid(&self, pagename: &str) -> Result<Option<PageId>> {
        let value = self.driver.query_value(
            &format!("SELECT id FROM {} WHERE pagename = ?1", self.t.page),
            &[text(pagename)],
        )?;
        Ok(value.as_ref().and_then(value_i64).map(PageId::from_raw))
    }

    /// Decodes a row of `page_fields` optionally followed by `version_fields`.
    fn page_record(&self, row: &SqlRow) -> Result<PageRecord> {
        let mut record = PageRecord::page(
            value_string(col(row, 1)),
            PageData {
                hits: col_i64(row, 2),
                attrs: decode_attrs(&value_string(col(row, 3)))?,
            },
        );
        if row.len() >= 9 {
            record.version = col_version(row, 4);
            record.versiondata = Some(VersionData {
                mtime: col_i64(row, 5),
                is_minor_edit: col_i64(row, 6) != 0,
                content: Content::Text(value_string(col(row, 7))),
                attrs: decode_attrs(&value_string(col(row, 8)))?,
            });
        }
        Ok(record)
    }

    fn iter(&self, sql: &str, params: &[SqlValue]) -> Result<PageIterator> {
        let rows = self.driver.query(sql, params)?;
        let records = rows
            .iter()
            .map(|row| self.page_record(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(PageIterator::new(records))
    }

    fn order_clause(&self, sortby: &SortBy) -> String {
        let column = match sortby.field {
            SortField::Pagename => format!("{}.pagename", self.t.page),
            SortField::Hits => format!("{}.hits", self.t.page),
            SortField::Mtime => format!("{}.mtime", self.t.version),
        };
        let direction = if sortby.descending { "DESC" } else { "ASC" };
        format!("ORDER BY {column} {direction}, {}.pagename ASC", self.t.page)
    }

    /// Recomputes the `recent` rows of one page, or of all pages.
    fn update_recent_table(&mut self, id: Option<PageId>) -> Result<()> {
        with_lock(self, true, |b| {
            let (filter, params) = match id {
                Some(id) => (" WHERE id = ?1", vec![int(id.as_raw())]),
                None => ("", Vec::new()),
            };
            b.driver
                .execute(&format!("DELETE FROM {}{filter}", b.t.recent), &params)?;
            b.driver.execute(
                &format!(
                    "INSERT INTO {recent} (id, latestversion, latestmajor, latestminor) \
                     SELECT id, MAX(version), \
                            MAX(CASE WHEN minor_edit = 0 THEN version END), \
                            MAX(CASE WHEN minor_edit <> 0 THEN version END) \
                     FROM {version}{filter} GROUP BY id",
                    recent = b.t.recent,
                    version = b.t.version,
                ),
                &params,
            )?;
            Ok(())
        })
    }

    /// Recomputes the `nonempty` rows of one page, or of all pages.
    fn update_nonempty_table(&mut self, id: Option<PageId>) -> Result<()> {
        with_lock(self, true, |b| {
            let params = id.map(|id| vec![int(id.as_raw())]).unwrap_or_default();
            let delete_filter = if id.is_some() { " WHERE id = ?1" } else { "" };
            let insert_filter = if id.is_some() {
                format!(" AND {}.id = ?1", b.t.recent)
            } else {
                String::new()
            };
            b.driver
                .execute(&format!("DELETE FROM {}{delete_filter}", b.t.nonempty), &params)?;
            b.driver.execute(
                &format!(
                    "INSERT INTO {nonempty} (id) \
                     SELECT {recent}.id FROM {recent}, {version} \
                     WHERE {recent}.id = {version}.id \
                       AND {version}.version = {recent}.latestversion \
                       AND {version}.content <> ''{insert_filter}",
                    nonempty = b.t.nonempty,
                    recent = b.t.recent,
                    version = b.t.version,
                ),
                &params,
            )?;
            Ok(())
        })
    }

    fn delete_page_contents(&mut self, id: PageId) -> Result<()> {
        let params = [int(id.as_raw())];
        for (table, column) in [
            (&self.t.version, "id"),
            (&self.t.recent, "id"),
            (&self.t.nonempty, "id"),
            (&self.t.link, "linkfrom"),
        ] {
            self.driver
                .execute(&format!("DELETE FROM {table} WHERE {column} = ?1"), &params)?;
        }
        Ok(())
    }

    fn incoming_link_count(&self, id: PageId) -> Result<i64> {
        let value = self.driver.query_value(
            &format!("SELECT COUNT(*) FROM {} WHERE linkto = ?1", self.t.link),
            &[int(id.as_raw())],
        )?;
        Ok(value.as_ref().and_then(value_i64).unwrap_or(0))
    }

    fn pagename_for(&self, id: i64) -> Result<String> {
        let value = self.driver.query_value(
            &format!("SELECT pagename FROM {} WHERE id = ?1", self.t.page),
            &[int(id)],
        )?;
        Ok(value.map_or_else(|| format!("#{id}"), |v| value_string(&v)))
    }
}

/// The SQL backend over SQLite.
pub type SqliteBackend = SqlBackend<SqliteDriver>;

impl SqlBackend<SqliteDriver> {
    /// A fresh in-memory database with the schema applied.
    pub fn open_in_memory(prefix: &str) -> Result<Self> {
        let driver = SqliteDriver::open_in_memory()?;
        apply_schema(&driver, prefix)?;
        Self::with_driver(driver, prefix)
    }
}

impl<D: SqlDriver> Backend for SqlBackend<D> {
    fn engine(&self) -> &'static str {
        "sql"
    }

    fn is_wiki_page(&self, pagename: &str) -> Result<bool> {
        validate_pagename(pagename)?;
        let value = self.driver.query_value(
            &format!(
                "SELECT {p}.id FROM {n}, {p} WHERE {n}.id = {p}.id AND {p}.pagename = ?1",
                p = self.t.page,
                n = self.t.nonempty
            ),
            &[text(pagename)],
        )?;
        Ok(value.is_some())
    }

    fn get_all_pagenames(&self) -> Result<Vec<String>> {
        let rows = self.driver.query(
            &format!(
                "SELECT {p}.pagename FROM {n}, {p} WHERE {n}.id = {p}.id ORDER BY {p}.pagename",
                p = self.t.page,
                n = self.t.nonempty
            ),
            &[],
        )?;
        Ok(rows.iter().map(|r| value_string(col(r, 0))).collect())
    }

    fn get_pagedata(&self, pagename: &str) -> Result<Option<PageData>> {
        validate_pagename(pagename)?;
        let rows = self.driver.query(
            &format!("SELECT hits, pagedata FROM {} WHERE pagename = ?1", self.t.page),
            &[text(pagename)],
        )?;
        match rows.first() {
            None => Ok(None),
            Some(row) => Ok(Some(PageData {
                hits: col_i64(row, 0),
                attrs: decode_attrs(&value_string(col(row, 1)))?,
            })),
        }
    }

    fn update_pagedata(&mut self, pagename: &str, update: &AttrMap) -> Result<()> {
        validate_pagename(pagename)?;

        // Hit counting happens on every page view: one UPDATE, no lock cycle.
        if update.len() == 1 {
            if let Some(hits) = update.get(ATTR_HITS) {
                self.driver.execute(
                    &format!("UPDATE {} SET hits = ?1 WHERE pagename = ?2", self.t.page),
                    &[int(hits.as_int().unwrap_or(0)), text(pagename)],
                )?;
                return Ok(());
            }
        }

        with_lock(self, true, |b| {
            let mut data = match b.get_pagedata(pagename)? {
                Some(data) => data,
                None => {
                    b.get_pageid(pagename, true)?;
                    PageData::default()
                }
            };
            let mut rest = update.clone();
            if let Some(hits) = rest.remove(ATTR_HITS) {
                data.hits = hits.as_int().unwrap_or(0);
            }
            merge_attrs(&mut data.attrs, &rest);
            b.driver.execute(
                &format!(
                    "UPDATE {} SET hits = ?1, pagedata = ?2 WHERE pagename = ?3",
                    b.t.page
                ),
                &[int(data.hits), text(&encode_attrs(&data.attrs)?), text(pagename)],
            )?;
            Ok(())
        })
    }

    fn delete_page(&mut self, pagename: &str) -> Result<()> {
        validate_pagename(pagename)?;
        with_lock(self, true, |b| {
            let Some(id) = b.get_pageid(pagename, false)? else {
                return Ok(());
            };
            b.delete_page_contents(id)?;
            if b.incoming_link_count(id)? > 0 {
                b.driver.execute(
                    &format!("UPDATE {} SET hits = 0, pagedata = '' WHERE id = ?1", b.t.page),
                    &[int(id.as_raw())],
                )?;
                debug!(pagename, "page demoted to placeholder");
            } else {
                b.driver.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", b.t.page),
                    &[int(id.as_raw())],
                )?;
            }
            Ok(())
        })
    }

    fn rename_page(&mut self, from: &str, to: &str) -> Result<Option<PageId>> {
        validate_pagename(from)?;
        validate_pagename(to)?;
        with_lock(self, true, |b| {
            let Some(id) = b.get_pageid(from, false)? else {
                return Ok(None);
            };
            if from == to {
                return Ok(Some(id));
            }
            if let Some(old) = b.get_pageid(to, false)? {
                if b.is_wiki_page(to)? {
                    return Err(Error::PageExists {
                        pagename: to.to_string(),
                    });
                }
                // Absorb the placeholder: pages linking to it now link to us.
                b.delete_page_contents(old)?;
                b.driver.execute(
                    &format!(
                        "DELETE FROM {l} WHERE linkto = ?1 \
                         AND linkfrom IN (SELECT linkfrom FROM {l} WHERE linkto = ?2)",
                        l = b.t.link
                    ),
                    &[int(old.as_raw()), int(id.as_raw())],
                )?;
                b.driver.execute(
                    &format!("UPDATE {} SET linkto = ?1 WHERE linkto = ?2", b.t.link),
                    &[int(id.as_raw()), int(old.as_raw())],
                )?;
                b.driver.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", b.t.page),
                    &[int(old.as_raw())],
                )?;
            }
            b.driver.execute(
                &format!("UPDATE {} SET pagename = ?1 WHERE id = ?2", b.t.page),
                &[text(to), int(id.as_raw())],
            )?;
            info!(from, to, id = %id, "renamed page");
            Ok(Some(id))
        })
    }

    fn get_latest_version(&self, pagename: &str) -> Result<u32> {
        validate_pagename(pagename)?;
        let rows = self.driver.query(
            &format!(
                "SELECT latestversion FROM {p}, {r} WHERE {p}.id = {r}.id AND {p}.pagename = ?1",
                p = self.t.page,
                r = self.t.recent
            ),
            &[text(pagename)],
        )?;
        Ok(rows.first().and_then(|r| col_version(r, 0)).unwrap_or(0))
    }

    fn get_previous_version(&self, pagename: &str, version: u32) -> Result<u32> {
        validate_pagename(pagename)?;
        let rows = self.driver.query(
            &format!(
                "SELECT {v}.version FROM {v}, {p} \
                 WHERE {v}.id = {p}.id AND {p}.pagename = ?1 AND {v}.version < ?2 \
                 ORDER BY {v}.version DESC LIMIT 1",
                v = self.t.version,
                p = self.t.page
            ),
            &[text(pagename), int(i64::from(version))],
        )?;
        Ok(rows.first().and_then(|r| col_version(r, 0)).unwrap_or(0))
    }

    fn get_versiondata(
        &self,
        pagename: &str,
        version: u32,
        want_content: bool,
    ) -> Result<Option<VersionData>> {
        validate_pagename(pagename)?;
        let content_expr = if want_content {
            "content"
        } else {
            "CASE WHEN content <> '' THEN 1 ELSE 0 END"
        };
        let rows = self.driver.query(
            &format!(
                "SELECT mtime, minor_edit, {content_expr}, versiondata FROM {v}, {p} \
                 WHERE {v}.id = {p}.id AND {p}.pagename = ?1 AND {v}.version = ?2",
                v = self.t.version,
                p = self.t.page
            ),
            &[text(pagename), int(i64::from(version))],
        )?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let content = if want_content {
            Content::Text(value_string(col(row, 2)))
        } else if col_i64(row, 2) != 0 {
            Content::NonEmpty
        } else {
            Content::Empty
        };
        Ok(Some(VersionData {
            mtime: col_i64(row, 0),
            is_minor_edit: col_i64(row, 1) != 0,
            content,
            attrs: decode_attrs(&value_string(col(row, 3)))?,
        }))
    }

    fn set_versiondata(&mut self, pagename: &str, version: u32, data: &VersionData) -> Result<()> {
        validate_pagename(pagename)?;
        validate_version(version)?;
        let content = data.text_for_write()?;
        let versiondata = encode_attrs(&data.attrs)?;

        with_lock(self, true, |b| {
            let id = b
                .get_pageid(pagename, true)?
                .ok_or_else(|| Error::Corrupt(format!("page row for '{pagename}' vanished")))?;
            let key = [int(id.as_raw()), int(i64::from(version))];
            b.driver.execute(
                &format!("DELETE FROM {} WHERE id = ?1 AND version = ?2", b.t.version),
                &key,
            )?;
            b.driver.execute(
                &format!(
                    "INSERT INTO {} (id, version, mtime, minor_edit, content, versiondata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    b.t.version
                ),
                &[
                    key[0].clone(),
                    key[1].clone(),
                    int(data.mtime),
                    int(i64::from(data.is_minor_edit)),
                    text(content),
                    text(&versiondata),
                ],
            )?;
            b.update_recent_table(Some(id))?;
            b.update_nonempty_table(Some(id))
        })
    }

    fn delete_versiondata(&mut self, pagename: &str, version: u32) -> Result<()> {
        validate_pagename(pagename)?;
        with_lock(self, true, |b| {
            let Some(id) = b.get_pageid(pagename, false)? else {
                return Ok(());
            };
            b.driver.execute(
                &format!("DELETE FROM {} WHERE id = ?1 AND version = ?2", b.t.version),
                &[int(id.as_raw()), int(i64::from(version))],
            )?;
            b.update_recent_table(Some(id))?;
            b.update_nonempty_table(Some(id))
        })
    }

    fn get_recent(&self, pagename: &str) -> Result<Option<RecentPointers>> {
        validate_pagename(pagename)?;
        let rows = self.driver.query(
            &format!(
                "SELECT latestversion, latestmajor, latestminor FROM {p}, {r} \
                 WHERE {p}.id = {r}.id AND {p}.pagename = ?1",
                p = self.t.page,
                r = self.t.recent
            ),
            &[text(pagename)],
        )?;
        Ok(rows.first().and_then(|row| {
            Some(RecentPointers {
                latest_version: col_version(row, 0)?,
                latest_major: col_version(row, 1),
                latest_minor: col_version(row, 2),
            })
        }))
    }

    fn set_links(&mut self, pagename: &str, links: &[String]) -> Result<()> {
        validate_pagename(pagename)?;
        for link in links {
            validate_pagename(link)?;
        }
        with_lock(self, true, |b| {
            let from = b
                .get_pageid(pagename, true)?
                .ok_or_else(|| Error::Corrupt(format!("page row for '{pagename}' vanished")))?;
            b.driver.execute(
                &format!("DELETE FROM {} WHERE linkfrom = ?1", b.t.link),
                &[int(from.as_raw())],
            )?;
            let targets: BTreeSet<&str> = links.iter().map(String::as_str).collect();
            for target in targets {
                let to = b
                    .get_pageid(target, true)?
                    .ok_or_else(|| Error::Corrupt(format!("page row for '{target}' vanished")))?;
                b.driver.execute(
                    &format!("INSERT INTO {} (linkfrom, linkto) VALUES (?1, ?2)", b.t.link),
                    &[int(from.as_raw()), int(to.as_raw())],
                )?;
            }
            Ok(())
        })
    }

    fn get_links(&self, pagename: &str, reversed: bool) -> Result<PageIterator> {
        validate_pagename(pagename)?;
        let (have, want) = if reversed {
            ("linkee", "linker")
        } else {
            ("linker", "linkee")
        };
        self.iter(
            &format!(
                "SELECT DISTINCT {want}.id, {want}.pagename, {want}.hits, {want}.pagedata \
                 FROM {l} \
                 JOIN {p} AS linker ON {l}.linkfrom = linker.id \
                 JOIN {p} AS linkee ON {l}.linkto = linkee.id \
                 WHERE {have}.pagename = ?1 \
                 ORDER BY {want}.pagename",
                l = self.t.link,
                p = self.t.page
            ),
            &[text(pagename)],
        )
    }

    fn get_all_pages(
        &self,
        include_deleted: bool,
        sortby: Option<SortBy>,
        limit: Option<usize>,
    ) -> Result<PageIterator> {
        let t = &self.t;
        let order = sortby
            .map(|s| self.order_clause(&s))
            .unwrap_or_else(|| format!("ORDER BY {}.pagename", t.page));
        let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let by_mtime = sortby.is_some_and(|s| s.field == SortField::Mtime);

        let mut tables = vec![t.page.clone()];
        let mut joins = Vec::new();
        if !include_deleted {
            tables.push(t.nonempty.clone());
            joins.push(format!("{}.id = {}.id", t.nonempty, t.page));
        }
        if by_mtime {
            tables.push(t.recent.clone());
            tables.push(t.version.clone());
            joins.push(format!("{}.id = {}.id", t.page, t.recent));
            joins.push(format!(
                "{p}.id = {v}.id AND {v}.version = {r}.latestversion",
                p = t.page,
                v = t.version,
                r = t.recent
            ));
        }
        let where_clause = if joins.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", joins.join(" AND "))
        };

        self.iter(
            &format!(
                "SELECT {} FROM {}{where_clause} {order}{limit}",
                self.page_fields,
                tables.join(", ")
            ),
            &[],
        )
    }

    fn text_search(&self, query: &TextQuery, fullsearch: bool) -> Result<PageIterator> {
        let t = &self.t;
        let mut tables = format!("{}, {}", t.nonempty, t.page);
        let mut join = format!("{}.id = {}.id", t.nonempty, t.page);
        let mut fields = self.page_fields.clone();
        let content_column = format!("{}.content", t.version);

        if fullsearch {
            tables.push_str(&format!(", {}, {}", t.recent, t.version));
            join.push_str(&format!(
                " AND {p}.id = {r}.id AND {p}.id = {v}.id AND {v}.version = {r}.latestversion",
                p = t.page,
                r = t.recent,
                v = t.version
            ));
            fields.push_str(", ");
            fields.push_str(&self.version_fields);
        }

        let clause = query.sql_clause(
            &format!("{}.pagename", t.page),
            fullsearch.then_some(content_column.as_str()),
            |s| self.driver.quote(s),
        );
        self.iter(
            &format!(
                "SELECT {fields} FROM {tables} WHERE {join} AND ({clause}) ORDER BY {}.pagename",
                t.page
            ),
            &[],
        )
    }

    fn most_popular(&self, limit: i64, sortby: Option<SortBy>) -> Result<PageIterator> {
        let (direction, limit) = if limit < 0 {
            ("ASC", -limit)
        } else {
            ("DESC", limit)
        };
        let limit = if limit == 0 { DEFAULT_POPULAR_LIMIT } else { limit };
        let order = sortby
            .filter(|s| s.field != SortField::Mtime)
            .map(|s| self.order_clause(&s))
            .unwrap_or_else(|| {
                format!(
                    "ORDER BY {p}.hits {direction}, {p}.pagename ASC",
                    p = self.t.page
                )
            });
        self.iter(
            &format!(
                "SELECT {fields} FROM {n}, {p} WHERE {n}.id = {p}.id {order} LIMIT {limit}",
                fields = self.page_fields,
                n = self.t.nonempty,
                p = self.t.page
            ),
            &[],
        )
    }

    fn most_recent(&self, query: &RecentQuery) -> Result<PageIterator> {
        let t = &self.t;
        let mut params = Vec::new();
        let mut pick = Vec::new();
        if let Some(since) = query.since {
            params.push(int(since));
            pick.push(format!("{}.mtime >= ?1", t.version));
        }

        let (tables, join) = if query.include_all_revisions {
            if query.exclude_major_revisions {
                pick.push("minor_edit <> 0".to_string());
            } else if !query.include_minor_revisions {
                pick.push("minor_edit = 0".to_string());
            }
            (
                format!("{}, {}", t.page, t.version),
                format!("{}.id = {}.id", t.page, t.version),
            )
        } else {
            let pointer = if query.exclude_major_revisions {
                "latestminor"
            } else if !query.include_minor_revisions {
                "latestmajor"
            } else {
                "latestversion"
            };
            pick.push(format!("{}.version = {}.{pointer}", t.version, t.recent));
            (
                format!("{}, {}, {}", t.page, t.recent, t.version),
                format!(
                    "{p}.id = {r}.id AND {v}.id = {p}.id",
                    p = t.page,
                    r = t.recent,
                    v = t.version
                ),
            )
        };

        let (direction, limit) = if query.limit < 0 {
            ("ASC", -query.limit)
        } else {
            ("DESC", query.limit)
        };
        let limit = if limit > 0 {
            format!(" LIMIT {limit}")
        } else {
            String::new()
        };
        let mut where_clause = join;
        for p in pick {
            where_clause.push_str(" AND ");
            where_clause.push_str(&p);
        }

        self.iter(
            &format!(
                "SELECT {}, {} FROM {tables} WHERE {where_clause} \
                 ORDER BY {v}.mtime {direction}, {p}.pagename ASC, {v}.version {direction}{limit}",
                self.page_fields,
                self.version_fields,
                v = t.version,
                p = t.page
            ),
            &params,
        )
    }

    fn lock(&mut self, write: bool) -> Result<()> {
        if self.lock.acquire() {
            if let Err(e) = self.driver.begin(write) {
                self.lock.abort_acquire();
                return Err(e);
            }
        }
        Ok(())
    }

    fn unlock(&mut self, force: bool) -> Result<()> {
        match self.lock.release(force) {
            Release::Outermost { commit: true } => {
                if let Err(e) = self.driver.finish(true) {
                    // A failed COMMIT leaves the transaction open.
                    if let Err(rollback) = self.driver.finish(false) {
                        warn!(error = %rollback, "rollback after failed commit failed");
                    }
                    return Err(e);
                }
                Ok(())
            }
            Release::Outermost { commit: false } => {
                warn!("rolling back failed write scope");
                self.driver.finish(false)
            }
            Release::Inner | Release::NotHeld => Ok(()),
        }
    }

    fn poison_lock(&mut self) {
        self.lock.poison();
    }

    fn lock_depth(&self) -> u32 {
        self.lock.depth()
    }

    fn rebuild_indexes(&mut self) -> Result<()> {
        with_lock(self, true, |b| {
            b.update_recent_table(None)?;
            b.update_nonempty_table(None)
        })?;
        info!("rebuilt recent and nonempty tables");
        Ok(())
    }

    fn check(&self) -> Result<Vec<String>> {
        let t = &self.t;
        let mut problems = Vec::new();

        let computed: HashMap<i64, (Option<u32>, Option<u32>, Option<u32>)> = self
            .driver
            .query(
                &format!(
                    "SELECT id, MAX(version), \
                            MAX(CASE WHEN minor_edit = 0 THEN version END), \
                            MAX(CASE WHEN minor_edit <> 0 THEN version END) \
                     FROM {} GROUP BY id",
                    t.version
                ),
                &[],
            )?
            .iter()
            .map(|r| (col_i64(r, 0), (col_version(r, 1), col_version(r, 2), col_version(r, 3))))
            .collect();
        let stored: HashMap<i64, (Option<u32>, Option<u32>, Option<u32>)> = self
            .driver
            .query(
                &format!(
                    "SELECT id, latestversion, latestmajor, latestminor FROM {}",
                    t.recent
                ),
                &[],
            )?
            .iter()
            .map(|r| (col_i64(r, 0), (col_version(r, 1), col_version(r, 2), col_version(r, 3))))
            .collect();

        for (id, expected) in &computed {
            match stored.get(id) {
                Some(actual) if actual == expected => {}
                Some(actual) => problems.push(format!(
                    "recent entry of '{}' is {actual:?}, expected {expected:?}",
                    self.pagename_for(*id)?
                )),
                None => problems.push(format!(
                    "page '{}' has versions but no recent entry",
                    self.pagename_for(*id)?
                )),
            }
        }
        for id in stored.keys().filter(|id| !computed.contains_key(id)) {
            problems.push(format!(
                "recent entry for '{}' without versions",
                self.pagename_for(*id)?
            ));
        }

        let expected_nonempty: BTreeSet<i64> = self
            .driver
            .query(
                &format!(
                    "SELECT v.id FROM {v} AS v \
                     WHERE v.content <> '' \
                       AND v.version = (SELECT MAX(version) FROM {v} WHERE id = v.id)",
                    v = t.version
                ),
                &[],
            )?
            .iter()
            .map(|r| col_i64(r, 0))
            .collect();
        let actual_nonempty: BTreeSet<i64> = self
            .driver
            .query(&format!("SELECT id FROM {}", t.nonempty), &[])?
            .iter()
            .map(|r| col_i64(r, 0))
            .collect();
        for id in expected_nonempty.difference(&actual_nonempty) {
            problems.push(format!("page '{}' missing from nonempty", self.pagename_for(*id)?));
        }
        for id in actual_nonempty.difference(&expected_nonempty) {
            problems.push(format!("page '{}' wrongly in nonempty", self.pagename_for(*id)?));
        }

        let dangling = self.driver.query(
            &format!(
                "SELECT linkfrom, linkto FROM {l} \
                 WHERE linkfrom NOT IN (SELECT id FROM {p}) OR linkto NOT IN (SELECT id FROM {p})",
                l = t.link,
                p = t.page
            ),
            &[],
        )?;
        for row in &dangling {
            problems.push(format!(
                "link {} -> {} references a missing page",
                col_i64(row, 0),
                col_i64(row, 1)
            ));
        }

        Ok(problems)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn optimize(&mut self) -> Result<()> {
        if self.lock.depth() > 0 {
            return Err(Error::InvalidArgument(
                "cannot optimize inside a lock scope".into(),
            ));
        }
        self.driver.optimize()?;
        info!("optimized sql database");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.lock.depth() > 0 {
            warn!(depth = self.lock.depth(), "closing sql backend with an open lock scope");
            self.unlock(true)?;
        }
        Ok(())
    }
}

impl<D: SqlDriver> Drop for SqlBackend<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing sql backend");
        }
    }
}
