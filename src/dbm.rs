//! # DBM Backend
//!
//! [`DbmBackend`] keeps a whole wiki in one [`KvStore`] file,
//! `<directory>/<prefix>pagedb.<handler>`.
//!
//! ## Key Layout
//!
//! ```text
//! p:<pagename>   → StoredPage (JSON: id, hits, pagedata, versions, links, caches)
//! i:<id>         → pagename
//! m:next_id      → next id to hand out (decimal)
//! ```
//!
//! A page record carries its own outgoing links (by id) and cached
//! RecentIndex / NonEmptyIndex values. Everything that needs to look across
//! pages (backlinks, listings, search, recent changes) is a full scan of the
//! `p:` range; cost grows with the number of pages.
//!
//! ## Locking
//!
//! The store's lock file is held from `open` until `close`, so no other
//! process writes underneath us. `lock`/`unlock` only count nesting depth;
//! the outermost `unlock` syncs the file. Each page record is replaced as a
//! unit, but a poisoned scope cannot undo records it already rewrote.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::backend::{with_lock, Backend, LockCounter, Release};
use crate::codec::{decode_page, encode_page, StoredPage, StoredVersion};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};
use crate::iterator::PageIterator;
use crate::kvstore::{KvStore, OpenMode};
use crate::search::TextQuery;
use crate::types::{
    merge_attrs, validate_pagename, validate_version, AttrMap, PageData, PageId, PageRecord,
    RecentPointers, RecentQuery, SortBy, SortField, VersionData, ATTR_HITS,
};

/// File base name of the page store.
pub const PAGEDB_BASE: &str = "pagedb";

const PAGE_PREFIX: &[u8] = b"p:";
const ID_PREFIX: &[u8] = b"i:";
const NEXT_ID_KEY: &[u8] = b"m:next_id";

const DEFAULT_POPULAR_LIMIT: usize = 20;

fn page_key(pagename: &str) -> Vec<u8> {
    [PAGE_PREFIX, pagename.as_bytes()].concat()
}

fn id_key(id: PageId) -> Vec<u8> {
    [ID_PREFIX, id.as_raw().to_string().as_bytes()].concat()
}

/// Mtime of a page's latest version, 0 if it has none.
fn latest_mtime(page: &StoredPage) -> i64 {
    page.versions
        .values()
        .next_back()
        .map_or(0, |v| v.mtime)
}

fn record(pagename: &str, page: &StoredPage) -> PageRecord {
    PageRecord::page(pagename, page.page_data())
}

fn record_with_version(pagename: &str, page: &StoredPage, version: u32, sv: &StoredVersion) -> PageRecord {
    let mut rec = record(pagename, page);
    rec.version = Some(version);
    rec.versiondata = Some(sv.to_versiondata(true));
    rec
}

/// The key/value [`Backend`].
#[derive(Debug)]
pub struct DbmBackend {
    store: Option<KvStore>,
    lock: LockCounter,
}

impl DbmBackend {
    /// Opens (creating if needed) the page store described by `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for a non-DBM config or a bad prefix
    /// - [`Error::LockTimeout`] if another process holds the store
    /// - [`Error::StoreOpen`] / [`Error::Store`] if the file is unusable
    pub fn open(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let (BackendKind::Dbm { handler, .. }, Some(path)) =
            (&config.kind, config.dbm_path(PAGEDB_BASE))
        else {
            return Err(Error::Config("not a dbm backend configuration".into()));
        };
        let store = KvStore::open(&path, OpenMode::Write, *handler, config.lock_timeout)?;
        info!(path = %path.display(), pages = store.keys_with_prefix(PAGE_PREFIX).len(), "opened dbm backend");
        Ok(Self {
            store: Some(store),
            lock: LockCounter::default(),
        })
    }

    // =========================================================================
    // Record access
    // =========================================================================

    fn store(&self) -> Result<&KvStore> {
        self.store.as_ref().ok_or_else(closed_error)
    }

    fn store_mut(&mut self) -> Result<&mut KvStore> {
        self.store.as_mut().ok_or_else(closed_error)
    }

    fn load_page(&self, pagename: &str) -> Result<Option<StoredPage>> {
        self.store()?
            .get(&page_key(pagename))
            .map(|bytes| decode_page(&bytes))
            .transpose()
    }

    fn save_page(&mut self, pagename: &str, page: &StoredPage) -> Result<()> {
        let bytes = encode_page(page)?;
        self.store_mut()?.set(&page_key(pagename), Some(&bytes))
    }

    fn name_for_id(&self, id: PageId) -> Result<Option<String>> {
        Ok(self
            .store()?
            .get(&id_key(id))
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Every page record, in pagename order.
    fn scan_pages(&self) -> Result<Vec<(String, StoredPage)>> {
        self.store()?
            .scan_prefix(PAGE_PREFIX)
            .map(|(key, value)| -> Result<(String, StoredPage)> {
                let name = String::from_utf8_lossy(&key[PAGE_PREFIX.len()..]).into_owned();
                Ok((name, decode_page(value)?))
            })
            .collect()
    }

    fn next_id(&self) -> Result<i64> {
        Ok(self
            .store()?
            .get(NEXT_ID_KEY)
            .and_then(|b| String::from_utf8_lossy(&b).parse().ok())
            .unwrap_or(1))
    }

    fn allocate_id(&mut self) -> Result<PageId> {
        let id = self.next_id()?;
        self.store_mut()?
            .set(NEXT_ID_KEY, Some((id + 1).to_string().as_bytes()))?;
        Ok(PageId::from_raw(id))
    }

    /// Loads a page, creating a placeholder record if it doesn't exist.
    fn get_or_create(&mut self, pagename: &str) -> Result<StoredPage> {
        if let Some(page) = self.load_page(pagename)? {
            return Ok(page);
        }
        let page = StoredPage::new(self.allocate_id()?);
        self.save_page(pagename, &page)?;
        self.store_mut()?
            .set(&id_key(page.id), Some(pagename.as_bytes()))?;
        debug!(pagename, id = %page.id, "created page record");
        Ok(page)
    }

    fn remove_page(&mut self, pagename: &str, id: PageId) -> Result<()> {
        let store = self.store_mut()?;
        store.set(&page_key(pagename), None)?;
        store.set(&id_key(id), None)
    }

    /// True if some other page links to `id`. A page's links to itself do
    /// not keep it alive.
    fn has_backlinks(&self, id: PageId) -> Result<bool> {
        Ok(self
            .scan_pages()?
            .iter()
            .any(|(_, page)| page.id != id && page.links.contains(&id)))
    }

    fn sort_records(pages: &mut [(String, StoredPage)], sortby: SortBy) {
        pages.sort_by(|(an, a), (bn, b)| {
            let primary = match sortby.field {
                SortField::Pagename => an.cmp(bn),
                SortField::Hits => a.hits.cmp(&b.hits),
                SortField::Mtime => latest_mtime(a).cmp(&latest_mtime(b)),
            };
            sortby.apply(primary).then_with(|| an.cmp(bn))
        });
    }
}

fn closed_error() -> Error {
    Error::Store {
        op: "access",
        key: String::new(),
        reason: "backend is closed".into(),
    }
}

impl Backend for DbmBackend {
    fn engine(&self) -> &'static str {
        "dbm"
    }

    fn is_wiki_page(&self, pagename: &str) -> Result<bool> {
        validate_pagename(pagename)?;
        Ok(self.load_page(pagename)?.is_some_and(|p| p.nonempty))
    }

    fn get_all_pagenames(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_pages()?
            .into_iter()
            .filter(|(_, page)| page.nonempty)
            .map(|(name, _)| name)
            .collect())
    }

    fn get_pagedata(&self, pagename: &str) -> Result<Option<PageData>> {
        validate_pagename(pagename)?;
        Ok(self.load_page(pagename)?.map(|p| p.page_data()))
    }

    fn update_pagedata(&mut self, pagename: &str, update: &AttrMap) -> Result<()> {
        validate_pagename(pagename)?;

        if update.len() == 1 {
            if let Some(hits) = update.get(ATTR_HITS) {
                let Some(mut page) = self.load_page(pagename)? else {
                    return Ok(());
                };
                page.hits = hits.as_int().unwrap_or(0);
                return self.save_page(pagename, &page);
            }
        }

        with_lock(self, true, |b| {
            let mut page = b.get_or_create(pagename)?;
            let mut rest = update.clone();
            if let Some(hits) = rest.remove(ATTR_HITS) {
                page.hits = hits.as_int().unwrap_or(0);
            }
            merge_attrs(&mut page.pagedata, &rest);
            b.save_page(pagename, &page)
        })
    }

    fn delete_page(&mut self, pagename: &str) -> Result<()> {
        validate_pagename(pagename)?;
        with_lock(self, true, |b| {
            let Some(mut page) = b.load_page(pagename)? else {
                return Ok(());
            };
            if b.has_backlinks(page.id)? {
                page.versions.clear();
                page.links.clear();
                page.hits = 0;
                page.pagedata.clear();
                page.reindex();
                debug!(pagename, "page demoted to placeholder");
                b.save_page(pagename, &page)
            } else {
                b.remove_page(pagename, page.id)
            }
        })
    }

    fn rename_page(&mut self, from: &str, to: &str) -> Result<Option<PageId>> {
        validate_pagename(from)?;
        validate_pagename(to)?;
        with_lock(self, true, |b| {
            let Some(page) = b.load_page(from)? else {
                return Ok(None);
            };
            let id = page.id;
            if from == to {
                return Ok(Some(id));
            }

            if let Some(existing) = b.load_page(to)? {
                if existing.nonempty {
                    return Err(Error::PageExists {
                        pagename: to.to_string(),
                    });
                }
                // Absorb the placeholder: pages linking to it now link to us.
                let old = existing.id;
                for (name, mut linker) in b.scan_pages()? {
                    if linker.links.contains(&old) {
                        for link in &mut linker.links {
                            if *link == old {
                                *link = id;
                            }
                        }
                        linker.links.sort();
                        linker.links.dedup();
                        b.save_page(&name, &linker)?;
                    }
                }
                b.remove_page(to, old)?;
            }

            // Reload: the scan above may have rewritten our own links.
            let page = b
                .load_page(from)?
                .ok_or_else(|| Error::Corrupt(format!("page record '{from}' vanished")))?;
            b.store_mut()?.set(&page_key(from), None)?;
            b.save_page(to, &page)?;
            b.store_mut()?.set(&id_key(id), Some(to.as_bytes()))?;
            info!(from, to, id = %id, "renamed page");
            Ok(Some(id))
        })
    }

    fn get_latest_version(&self, pagename: &str) -> Result<u32> {
        validate_pagename(pagename)?;
        Ok(self.load_page(pagename)?.map_or(0, |p| p.latest_version()))
    }

    fn get_previous_version(&self, pagename: &str, version: u32) -> Result<u32> {
        validate_pagename(pagename)?;
        Ok(self
            .load_page(pagename)?
            .and_then(|p| p.versions.range(..version).next_back().map(|(v, _)| *v))
            .unwrap_or(0))
    }

    fn get_versiondata(
        &self,
        pagename: &str,
        version: u32,
        want_content: bool,
    ) -> Result<Option<VersionData>> {
        validate_pagename(pagename)?;
        Ok(self
            .load_page(pagename)?
            .and_then(|p| p.versions.get(&version).map(|sv| sv.to_versiondata(want_content))))
    }

    fn set_versiondata(&mut self, pagename: &str, version: u32, data: &VersionData) -> Result<()> {
        validate_pagename(pagename)?;
        validate_version(version)?;
        let stored = StoredVersion::from_versiondata(data, data.text_for_write()?);
        with_lock(self, true, |b| {
            let mut page = b.get_or_create(pagename)?;
            page.versions.insert(version, stored);
            page.reindex();
            b.save_page(pagename, &page)
        })
    }

    fn delete_versiondata(&mut self, pagename: &str, version: u32) -> Result<()> {
        validate_pagename(pagename)?;
        with_lock(self, true, |b| {
            let Some(mut page) = b.load_page(pagename)? else {
                return Ok(());
            };
            if page.versions.remove(&version).is_none() {
                return Ok(());
            }
            page.reindex();
            b.save_page(pagename, &page)
        })
    }

    fn get_recent(&self, pagename: &str) -> Result<Option<RecentPointers>> {
        validate_pagename(pagename)?;
        Ok(self.load_page(pagename)?.and_then(|p| p.recent))
    }

    fn set_links(&mut self, pagename: &str, links: &[String]) -> Result<()> {
        validate_pagename(pagename)?;
        for link in links {
            validate_pagename(link)?;
        }
        with_lock(self, true, |b| {
            let mut page = b.get_or_create(pagename)?;
            let mut ids = Vec::with_capacity(links.len());
            for target in links {
                if target == pagename {
                    ids.push(page.id);
                } else {
                    ids.push(b.get_or_create(target)?.id);
                }
            }
            ids.sort();
            ids.dedup();
            page.links = ids;
            b.save_page(pagename, &page)
        })
    }

    fn get_links(&self, pagename: &str, reversed: bool) -> Result<PageIterator> {
        validate_pagename(pagename)?;
        let Some(page) = self.load_page(pagename)? else {
            return Ok(PageIterator::empty());
        };

        let mut rows = Vec::new();
        if reversed {
            for (name, linker) in self.scan_pages()? {
                if linker.links.contains(&page.id) {
                    rows.push(record(&name, &linker));
                }
            }
        } else {
            for id in &page.links {
                let Some(name) = self.name_for_id(*id)? else {
                    warn!(pagename, target = %id, "dangling link id");
                    continue;
                };
                if let Some(target) = self.load_page(&name)? {
                    rows.push(record(&name, &target));
                }
            }
            rows.sort_by(|a, b| a.pagename.cmp(&b.pagename));
        }
        Ok(PageIterator::new(rows))
    }

    fn get_all_pages(
        &self,
        include_deleted: bool,
        sortby: Option<SortBy>,
        limit: Option<usize>,
    ) -> Result<PageIterator> {
        let mut pages: Vec<_> = self
            .scan_pages()?
            .into_iter()
            .filter(|(_, page)| include_deleted || page.nonempty)
            // Placeholders have no modification time to sort by.
            .filter(|(_, page)| {
                page.recent.is_some() || sortby.is_none_or(|s| s.field != SortField::Mtime)
            })
            .collect();
        if let Some(sortby) = sortby {
            Self::sort_records(&mut pages, sortby);
        }
        if let Some(limit) = limit {
            pages.truncate(limit);
        }
        Ok(PageIterator::new(
            pages.iter().map(|(name, page)| record(name, page)).collect(),
        ))
    }

    fn text_search(&self, query: &TextQuery, fullsearch: bool) -> Result<PageIterator> {
        let mut rows = Vec::new();
        for (name, page) in self.scan_pages()? {
            if !page.nonempty {
                continue;
            }
            let latest = page.versions.iter().next_back();
            if fullsearch {
                let content = latest.map(|(_, sv)| sv.content.as_str());
                if query.matches(&name, content) {
                    rows.push(match latest {
                        Some((v, sv)) => record_with_version(&name, &page, *v, sv),
                        None => record(&name, &page),
                    });
                }
            } else if query.matches(&name, None) {
                rows.push(record(&name, &page));
            }
        }
        Ok(PageIterator::new(rows))
    }

    fn most_popular(&self, limit: i64, sortby: Option<SortBy>) -> Result<PageIterator> {
        let descending = limit >= 0;
        let limit = match usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX) {
            0 => DEFAULT_POPULAR_LIMIT,
            n => n,
        };
        let order = sortby
            .filter(|s| s.field != SortField::Mtime)
            .unwrap_or(SortBy {
                field: SortField::Hits,
                descending,
            });

        let mut pages: Vec<_> = self
            .scan_pages()?
            .into_iter()
            .filter(|(_, page)| page.nonempty)
            .collect();
        Self::sort_records(&mut pages, order);
        pages.truncate(limit);
        Ok(PageIterator::new(
            pages.iter().map(|(name, page)| record(name, page)).collect(),
        ))
    }

    fn most_recent(&self, query: &RecentQuery) -> Result<PageIterator> {
        let since = query.since.unwrap_or(i64::MIN);
        let mut rows = Vec::new();

        for (name, page) in self.scan_pages()? {
            if query.include_all_revisions {
                for (v, sv) in &page.versions {
                    if query.wants(sv.minor) && sv.mtime >= since {
                        rows.push(record_with_version(&name, &page, *v, sv));
                    }
                }
                continue;
            }
            let Some(recent) = page.recent else {
                continue;
            };
            let pointer = if query.exclude_major_revisions {
                recent.latest_minor
            } else if !query.include_minor_revisions {
                recent.latest_major
            } else {
                Some(recent.latest_version)
            };
            if let Some((v, sv)) = pointer.and_then(|v| page.versions.get(&v).map(|sv| (v, sv))) {
                if sv.mtime >= since {
                    rows.push(record_with_version(&name, &page, v, sv));
                }
            }
        }

        // mtime, then pagename ascending, then version; mtime and version
        // follow the direction of the limit.
        let ascending = query.limit < 0;
        let directed = |o: Ordering| if ascending { o } else { o.reverse() };
        let mtime = |r: &PageRecord| r.versiondata.as_ref().map_or(0, |d| d.mtime);
        rows.sort_by(|a, b| {
            directed(mtime(a).cmp(&mtime(b)))
                .then_with(|| a.pagename.cmp(&b.pagename))
                .then_with(|| directed(a.version.cmp(&b.version)))
        });
        if query.limit != 0 {
            rows.truncate(usize::try_from(query.limit.unsigned_abs()).unwrap_or(usize::MAX));
        }
        Ok(PageIterator::new(rows))
    }

    fn lock(&mut self, _write: bool) -> Result<()> {
        self.store()?;
        self.lock.acquire();
        Ok(())
    }

    fn unlock(&mut self, force: bool) -> Result<()> {
        match self.lock.release(force) {
            Release::Outermost { commit } => {
                if !commit {
                    warn!("dbm write scope failed; records already written are kept");
                }
                self.store_mut()?.sync()
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
            let mut high = 0;
            let mut fixed = 0usize;
            for (name, mut page) in b.scan_pages()? {
                high = high.max(page.id.as_raw());
                let before = (page.recent, page.nonempty);
                page.reindex();
                if before != (page.recent, page.nonempty) {
                    b.save_page(&name, &page)?;
                    fixed += 1;
                }
                if b.name_for_id(page.id)?.as_deref() != Some(name.as_str()) {
                    b.store_mut()?.set(&id_key(page.id), Some(name.as_bytes()))?;
                    fixed += 1;
                }
            }
            if b.next_id()? <= high {
                b.store_mut()?
                    .set(NEXT_ID_KEY, Some((high + 1).to_string().as_bytes()))?;
                fixed += 1;
            }
            info!(fixed, "rebuilt dbm indexes");
            Ok(())
        })
    }

    fn check(&self) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let next_id = self.next_id()?;
        for (name, page) in self.scan_pages()? {
            let (recent, nonempty) = page.computed_index();
            if recent != page.recent {
                problems.push(format!(
                    "recent entry of '{name}' is {:?}, expected {recent:?}",
                    page.recent
                ));
            }
            if nonempty != page.nonempty {
                problems.push(format!(
                    "nonempty flag of '{name}' is {}, expected {nonempty}",
                    page.nonempty
                ));
            }
            if self.name_for_id(page.id)?.as_deref() != Some(name.as_str()) {
                problems.push(format!("id {} does not map back to '{name}'", page.id));
            }
            if page.id.as_raw() >= next_id {
                problems.push(format!("id {} of '{name}' is not below next_id {next_id}", page.id));
            }
            for link in &page.links {
                if self.name_for_id(*link)?.is_none() {
                    problems.push(format!("link {} -> {link} references a missing page", page.id));
                }
            }
        }
        Ok(problems)
    }

    fn sync(&mut self) -> Result<()> {
        self.store_mut()?.sync()
    }

    fn optimize(&mut self) -> Result<()> {
        self.store_mut()?.optimize()
    }

    fn close(&mut self) -> Result<()> {
        if self.store.is_none() {
            return Ok(());
        }
        if self.lock.depth() > 0 {
            warn!(depth = self.lock.depth(), "closing dbm backend with an open lock scope");
            self.unlock(true)?;
        }
        if let Some(store) = self.store.take() {
            info!(path = %store.path().display(), "closed dbm backend");
            store.close()?;
        }
        Ok(())
    }
}

impl Drop for DbmBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing dbm backend");
        }
    }
}
