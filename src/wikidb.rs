//! # Wiki Facade
//!
//! [`WikiDb`] is what a wiki front end holds: a backend plus the retention
//! policy. It adds the operations that span several backend calls.
//!
//! ## Saving a Revision
//!
//! ```text
//! create_revision("HomePage", 5, text, meta, links, now)
//!   │
//!   ├─ lock(write)
//!   │    ├─ latest == 4 ?                 otherwise Error::Conflict
//!   │    ├─ v4._supplanted = now
//!   │    ├─ set_versiondata(v5)
//!   │    └─ set_links
//!   ├─ unlock
//!   └─ expire_page("HomePage", now)       retention, own lock scope
//! ```

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::backend::{open_backend, with_lock, Backend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::retention::{merge_into, plan_expiry, ExpiryAction, RetentionPolicy, RevisionInfo};
use crate::types::{
    merge_attrs, validate_pagename, validate_version, AttrMap, Value, VersionData,
    ATTR_IS_MINOR_EDIT, ATTR_MTIME, ATTR_SUPPLANTED,
};

/// What one expiry pass removed from a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Versions deleted outright.
    pub deleted: Vec<u32>,
    /// `(version, into)` pairs: `version` was merged into `into`, then deleted.
    pub merged: Vec<(u32, u32)>,
}

impl ExpiryReport {
    /// True if nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.merged.is_empty()
    }

    /// Number of versions removed.
    pub fn removed(&self) -> usize {
        self.deleted.len() + self.merged.len()
    }
}

/// A backend together with its retention policy.
pub struct WikiDb {
    backend: Box<dyn Backend>,
    policy: RetentionPolicy,
}

impl std::fmt::Debug for WikiDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WikiDb")
            .field("engine", &self.backend.engine())
            .field("policy", &self.policy)
            .finish()
    }
}

impl WikiDb {
    /// Opens the configured backend with the default retention policy.
    pub fn open(config: &BackendConfig) -> Result<Self> {
        Ok(Self::with_backend(open_backend(config)?, RetentionPolicy::default()))
    }

    /// Wraps an already opened backend.
    pub fn with_backend(backend: Box<dyn Backend>, policy: RetentionPolicy) -> Self {
        Self { backend, policy }
    }

    /// The backend, for reads.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The backend, for direct writes.
    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    /// The retention policy.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Replaces the retention policy.
    pub fn set_policy(&mut self, policy: RetentionPolicy) {
        self.policy = policy;
    }

    /// Closes the backend.
    pub fn close(mut self) -> Result<()> {
        self.backend.close()
    }

    // =========================================================================
    // Revisions
    // =========================================================================

    /// Saves a new revision of a page.
    ///
    /// `version` must be exactly one above the current latest version.
    /// `meta` becomes the version's attributes; its `mtime` and
    /// `is_minor_edit` keys set the typed fields (`mtime` defaults to `now`).
    /// After the save, the retention policy runs on the page.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if someone else saved first. A failure of the
    /// retention pass is only logged: the revision is committed by then, so
    /// the saved data is still returned.
    pub fn create_revision(
        &mut self,
        pagename: &str,
        version: u32,
        content: &str,
        meta: &AttrMap,
        links: &[String],
        now: i64,
    ) -> Result<VersionData> {
        validate_pagename(pagename)?;
        validate_version(version)?;

        let mut data = VersionData::new(now, content);
        let mut attrs = AttrMap::new();
        for (key, value) in meta {
            match key.as_str() {
                ATTR_MTIME => {
                    if let Some(mtime) = value.as_int().filter(|m| *m > 0) {
                        data.mtime = mtime;
                    }
                }
                ATTR_IS_MINOR_EDIT => data.is_minor_edit = value.as_bool(),
                _ => {
                    attrs.insert(key.clone(), value.clone());
                }
            }
        }
        merge_attrs(&mut data.attrs, &attrs);

        with_lock(self.backend.as_mut(), true, |b| {
            let latest = b.get_latest_version(pagename)?;
            if version != latest + 1 {
                return Err(Error::Conflict {
                    pagename: pagename.to_string(),
                    expected: latest + 1,
                    actual: version,
                });
            }
            if latest > 0 {
                let mut stamp = AttrMap::new();
                stamp.insert(ATTR_SUPPLANTED.to_string(), Value::Int(now));
                b.update_versiondata(pagename, latest, &stamp)?;
            }
            b.set_versiondata(pagename, version, &data)?;
            b.set_links(pagename, links)
        })?;
        debug!(pagename, version, minor = data.is_minor_edit, "saved revision");

        if let Err(e) = self.expire_page(pagename, now) {
            warn!(pagename, version, error = %e, "expiring old revisions failed");
        }
        Ok(data)
    }

    /// Merges one revision into the revision before it, then deletes it.
    ///
    /// Returns the version it was merged into, or `None` if `version` does
    /// not exist. Merging the current revision makes the previous one
    /// current, carrying the merged content.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if there is no earlier revision.
    pub fn merge_revision(&mut self, pagename: &str, version: u32) -> Result<Option<u32>> {
        validate_pagename(pagename)?;
        with_lock(self.backend.as_mut(), true, |b| merge_one(b, pagename, version))
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Applies the retention policy to one page.
    pub fn expire_page(&mut self, pagename: &str, now: i64) -> Result<ExpiryReport> {
        validate_pagename(pagename)?;
        let policy = &self.policy;
        let report = with_lock(self.backend.as_mut(), true, |b| {
            let latest = b.get_latest_version(pagename)?;
            if latest == 0 {
                return Ok(ExpiryReport::default());
            }

            let mut history = Vec::new();
            let mut version = latest;
            while version > 0 {
                if let Some(data) = b.get_versiondata(pagename, version, false)? {
                    history.push(RevisionInfo::from_versiondata(version, &data));
                }
                version = b.get_previous_version(pagename, version)?;
            }

            let mut report = ExpiryReport::default();
            for action in plan_expiry(&history, now, policy) {
                if action.removed_version() == latest {
                    return Err(Error::LatestRevision {
                        pagename: pagename.to_string(),
                        version: latest,
                    });
                }
                match action {
                    ExpiryAction::Delete(v) => {
                        b.delete_versiondata(pagename, v)?;
                        report.deleted.push(v);
                    }
                    ExpiryAction::Merge { version, into } => {
                        merge_pair(b, pagename, version, into)?;
                        report.merged.push((version, into));
                    }
                }
            }
            Ok(report)
        })?;

        if !report.is_empty() {
            info!(
                pagename,
                deleted = report.deleted.len(),
                merged = report.merged.len(),
                "expired revisions"
            );
        }
        Ok(report)
    }

    /// Applies the retention policy to every page with history, including
    /// deleted pages. Returns the non-empty reports by page name.
    pub fn expire_all(&mut self, now: i64) -> Result<BTreeMap<String, ExpiryReport>> {
        let pagenames = self.backend.get_all_pages(true, None, None)?.pagenames();
        let mut reports = BTreeMap::new();
        for pagename in pagenames {
            let report = self.expire_page(&pagename, now)?;
            if !report.is_empty() {
                reports.insert(pagename, report);
            }
        }
        let removed: usize = reports.values().map(ExpiryReport::removed).sum();
        info!(pages = reports.len(), removed, "expiry pass finished");
        Ok(reports)
    }
}

fn merge_one(b: &mut dyn Backend, pagename: &str, version: u32) -> Result<Option<u32>> {
    if b.get_versiondata(pagename, version, false)?.is_none() {
        return Ok(None);
    }
    let into = b.get_previous_version(pagename, version)?;
    if into == 0 {
        return Err(Error::InvalidArgument(format!(
            "version {version} of '{pagename}' has no earlier revision to merge into"
        )));
    }
    merge_pair(b, pagename, version, into)?;
    Ok(Some(into))
}

/// `into` absorbs `version`, which is then deleted.
fn merge_pair(b: &mut dyn Backend, pagename: &str, version: u32, into: u32) -> Result<()> {
    let missing = |v: u32| Error::Corrupt(format!("version {v} of '{pagename}' vanished during merge"));
    let from = b
        .get_versiondata(pagename, version, true)?
        .ok_or_else(|| missing(version))?;
    let mut target = b
        .get_versiondata(pagename, into, true)?
        .ok_or_else(|| missing(into))?;
    merge_into(&mut target, &from);
    b.set_versiondata(pagename, into, &target)?;
    b.delete_versiondata(pagename, version)?;
    debug!(pagename, version, into, "merged revision");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::ExpireParams;
    use crate::driver::SqlDriver;
    use crate::sql::SqliteBackend;
    use crate::types::ATTR_AUTHOR;

    const DAY: i64 = 86_400;

    fn wiki(policy: RetentionPolicy) -> WikiDb {
        WikiDb::with_backend(Box::new(SqliteBackend::open_in_memory("").unwrap()), policy)
    }

    fn by(author: &str) -> AttrMap {
        let mut meta = AttrMap::new();
        meta.insert(ATTR_AUTHOR.into(), author.into());
        meta
    }

    #[test]
    fn test_create_revision_detects_conflicts() {
        let mut db = wiki(RetentionPolicy::keep_all());
        db.create_revision("P", 1, "one", &by("a"), &[], 10).unwrap();

        let err = db.create_revision("P", 1, "again", &by("b"), &[], 20).unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: 2, actual: 1, .. }));
        assert_eq!(db.backend().get_latest_version("P").unwrap(), 1);
        assert_eq!(db.backend().lock_depth(), 0);
    }

    #[test]
    fn test_create_revision_stamps_supplanted() {
        let mut db = wiki(RetentionPolicy::keep_all());
        db.create_revision("P", 1, "one", &by("a"), &[], 10).unwrap();
        let mut meta = by("a");
        meta.insert(ATTR_IS_MINOR_EDIT.into(), true.into());
        let saved = db.create_revision("P", 2, "two", &meta, &[], 20).unwrap();
        assert!(saved.is_minor_edit);
        assert_eq!(saved.mtime, 20);

        let v1 = db.backend().get_versiondata("P", 1, false).unwrap().unwrap();
        assert_eq!(v1.supplanted(), Some(20));
        let v2 = db.backend().get_versiondata("P", 2, false).unwrap().unwrap();
        assert_eq!(v2.supplanted(), None);
    }

    #[test]
    fn test_create_revision_survives_failed_expiry() {
        let purge_all = ExpireParams {
            max_keep: Some(0),
            ..ExpireParams::default()
        };
        let backend = SqliteBackend::open_in_memory("").unwrap();
        // Archived (stamped) versions cannot be deleted.
        backend
            .driver()
            .execute_batch(
                "CREATE TRIGGER keep_archived BEFORE DELETE ON version \
                 WHEN instr(old.versiondata, '_supplanted') > 0 \
                 BEGIN SELECT RAISE(ABORT, 'archived versions are read-only'); END",
            )
            .unwrap();
        let mut db = WikiDb::with_backend(
            Box::new(backend),
            RetentionPolicy {
                major: purge_all,
                minor: purge_all,
                author: purge_all,
            },
        );

        db.create_revision("P", 1, "one", &by("a"), &[], 10).unwrap();
        let saved = db.create_revision("P", 2, "two", &by("a"), &[], 20).unwrap();
        assert_eq!(saved.content.text(), Some("two"));
        assert_eq!(db.backend().get_latest_version("P").unwrap(), 2);
        assert!(db.backend().get_versiondata("P", 1, false).unwrap().is_some());
        assert_eq!(db.backend().lock_depth(), 0);

        // The page is still writable afterwards.
        db.create_revision("P", 3, "three", &by("a"), &[], 30).unwrap();
        assert_eq!(db.backend().get_latest_version("P").unwrap(), 3);
    }

    #[test]
    fn test_merge_revision_onto_previous() {
        let mut db = wiki(RetentionPolicy::keep_all());
        db.create_revision("P", 1, "one", &by("a"), &[], 10).unwrap();
        db.create_revision("P", 2, "two", &by("a"), &[], 20).unwrap();

        assert_eq!(db.merge_revision("P", 2).unwrap(), Some(1));
        assert_eq!(db.backend().get_latest_version("P").unwrap(), 1);
        let v1 = db.backend().get_versiondata("P", 1, true).unwrap().unwrap();
        assert_eq!(v1.content.text(), Some("two"));
        assert_eq!(v1.mtime, 20);
        assert_eq!(v1.supplanted(), None);

        assert_eq!(db.merge_revision("P", 7).unwrap(), None);
        assert!(matches!(db.merge_revision("P", 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_expire_page_uses_policy() {
        let policy = RetentionPolicy {
            major: ExpireParams {
                keep: Some(1),
                max_age: Some(1.0),
                ..ExpireParams::default()
            },
            minor: ExpireParams::default(),
            author: ExpireParams {
                keep: Some(0),
                ..ExpireParams::default()
            },
        };
        let mut db = wiki(policy);

        let start = 100 * DAY;
        for v in 1..=4 {
            db.create_revision("P", v, &format!("text {v}"), &by("a"), &[], start + i64::from(v) * 10 * DAY)
                .unwrap();
        }
        // v3 is the one archived revision young enough to keep.
        let mut versions = Vec::new();
        let mut v = db.backend().get_latest_version("P").unwrap();
        while v > 0 {
            versions.push(v);
            v = db.backend().get_previous_version("P", v).unwrap();
        }
        assert_eq!(versions, vec![4, 3]);
    }
}
