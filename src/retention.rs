//! # Revision Retention
//!
//! Decides which archived revisions of a page to purge. The current revision
//! is never touched.
//!
//! ## Classes
//!
//! Every archived revision belongs to the *major* or the *minor* class (by
//! its `is_minor_edit` flag). In addition, the most recent archived revision
//! of each distinct author is that author's *representative* and belongs to
//! the *author* class too.
//!
//! Each class has its own [`ExpireParams`] and its own counter, walking the
//! class newest-first:
//!
//! ```text
//! count >= max_keep                      → purge (hard cap)
//! count <  min_keep  or age <= min_age   → keep
//! count <  keep     and age <= max_age   → keep
//! otherwise                              → purge
//! ```
//!
//! `age` is measured in days since the revision was *supplanted* (replaced
//! by a newer one). A revision survives if its major/minor counter keeps it,
//! or if it is an author representative and the author counter keeps it.
//!
//! ## Merging
//!
//! When a purged revision is a minor edit and the version just before it is
//! by the same author, that earlier version absorbs the purged one's
//! content, `mtime` and supplanted time. A run of minor edits by one author
//! thereby collapses into its oldest member instead of vanishing.
//!
//! ## Idempotence
//!
//! Ages grow with age of the revision, so each counter keeps a prefix of its
//! class and purges the rest. Running the plan again on the surviving
//! revisions sees the same prefixes and purges nothing more.

use std::collections::HashSet;

use crate::types::{VersionData, ATTR_SUPPLANTED};

const SECONDS_PER_DAY: f64 = 86_400.0;

// =============================================================================
// Parameters
// =============================================================================

/// Retention parameters for one class. `None` means "no constraint": an
/// unset `keep`, `max_age` or `max_keep` is unlimited, an unset `min_keep`
/// or `min_age` is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpireParams {
    /// Never keep more than this many revisions.
    pub max_keep: Option<u32>,
    /// Always keep revisions younger than this (days).
    pub min_age: Option<f64>,
    /// Always keep at least this many revisions.
    pub min_keep: Option<u32>,
    /// Keep up to this many revisions that are younger than `max_age`.
    pub keep: Option<u32>,
    /// See `keep` (days).
    pub max_age: Option<f64>,
}

impl ExpireParams {
    /// Decides one revision given how many the class has kept so far.
    pub fn keeps(&self, count: u32, age_days: f64) -> bool {
        if self.max_keep.is_some_and(|max| count >= max) {
            return false;
        }
        if count < self.min_keep.unwrap_or(0) || age_days <= self.min_age.unwrap_or(0.0) {
            return true;
        }
        count < self.keep.unwrap_or(u32::MAX) && age_days <= self.max_age.unwrap_or(f64::INFINITY)
    }
}

/// Parameters for all three classes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Major edits.
    pub major: ExpireParams,
    /// Minor edits.
    pub minor: ExpireParams,
    /// Author representatives.
    pub author: ExpireParams,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            major: ExpireParams {
                max_age: Some(32.0),
                keep: Some(8),
                ..ExpireParams::default()
            },
            minor: ExpireParams {
                max_age: Some(7.0),
                keep: Some(4),
                ..ExpireParams::default()
            },
            author: ExpireParams {
                max_age: Some(365.0),
                keep: Some(8),
                min_age: Some(7.0),
                max_keep: Some(20),
                ..ExpireParams::default()
            },
        }
    }
}

impl RetentionPolicy {
    /// A policy that keeps everything.
    pub fn keep_all() -> Self {
        let all = ExpireParams {
            min_age: Some(f64::INFINITY),
            ..ExpireParams::default()
        };
        Self {
            major: all,
            minor: all,
            author: all,
        }
    }
}

// =============================================================================
// Planner Input / Output
// =============================================================================

/// What the planner needs to know about one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    /// Version number.
    pub version: u32,
    /// Modification time.
    pub mtime: i64,
    /// Minor-edit flag.
    pub is_minor_edit: bool,
    /// Author, if recorded.
    pub author: Option<String>,
    /// Explicit supplanted time, if recorded.
    pub supplanted: Option<i64>,
}

impl RevisionInfo {
    /// Extracts the retention-relevant fields of a version.
    pub fn from_versiondata(version: u32, data: &VersionData) -> Self {
        Self {
            version,
            mtime: data.mtime,
            is_minor_edit: data.is_minor_edit,
            author: data.author().map(str::to_string),
            supplanted: data.supplanted(),
        }
    }
}

/// One step of an expiry plan. Steps must be applied in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Delete this version.
    Delete(u32),
    /// Copy `version`'s content, `mtime` and `_supplanted` into `into`, then
    /// delete `version`.
    Merge {
        /// The purged version.
        version: u32,
        /// The version just before it.
        into: u32,
    },
}

impl ExpiryAction {
    /// The version this action removes.
    pub fn removed_version(&self) -> u32 {
        match self {
            Self::Delete(v) | Self::Merge { version: v, .. } => *v,
        }
    }
}

/// The attribute keys carried over by a merge besides content and `mtime`.
pub const MERGED_ATTRS: &[&str] = &[ATTR_SUPPLANTED];

// =============================================================================
// Planner
// =============================================================================

/// Plans the expiry of a page's history.
///
/// `history` may be in any order; the highest version is the current one
/// and is never purged. `now` is in seconds.
pub fn plan_expiry(history: &[RevisionInfo], now: i64, policy: &RetentionPolicy) -> Vec<ExpiryAction> {
    let mut revisions: Vec<&RevisionInfo> = history.iter().collect();
    revisions.sort_by(|a, b| b.version.cmp(&a.version));
    if revisions.len() < 2 {
        return Vec::new();
    }

    // Ages of the archived revisions, newest first. The supplanted time
    // falls back to the mtime of the next newer revision.
    let archived = &revisions[1..];
    let ages: Vec<f64> = archived
        .iter()
        .enumerate()
        .map(|(i, rev)| {
            let supplanted = rev.supplanted.unwrap_or(revisions[i].mtime);
            (now - supplanted) as f64 / SECONDS_PER_DAY
        })
        .collect();

    let mut major_count = 0u32;
    let mut minor_count = 0u32;
    let mut author_count = 0u32;
    let mut authors_seen: HashSet<&str> = HashSet::new();
    let mut purge = vec![false; archived.len()];

    for (i, rev) in archived.iter().enumerate() {
        let age = ages[i];

        let (params, count) = if rev.is_minor_edit {
            (&policy.minor, &mut minor_count)
        } else {
            (&policy.major, &mut major_count)
        };
        let class_keeps = params.keeps(*count, age);
        if class_keeps {
            *count += 1;
        }

        let mut author_keeps = false;
        if authors_seen.insert(rev.author.as_deref().unwrap_or("")) {
            author_keeps = policy.author.keeps(author_count, age);
            if author_keeps {
                author_count += 1;
            }
        }

        purge[i] = !(class_keeps || author_keeps);
    }

    let mut actions = Vec::new();
    for (i, rev) in archived.iter().enumerate() {
        if !purge[i] {
            continue;
        }
        let previous = archived.get(i + 1);
        let mergeable = rev.is_minor_edit
            && rev.author.as_deref().is_some_and(|a| !a.is_empty())
            && previous.is_some_and(|p| p.author == rev.author);
        match previous {
            Some(p) if mergeable => actions.push(ExpiryAction::Merge {
                version: rev.version,
                into: p.version,
            }),
            _ => actions.push(ExpiryAction::Delete(rev.version)),
        }
    }
    actions
}

/// Applies a merge to version data in memory: `into` takes `from`'s content,
/// `mtime` and carried attributes.
pub fn merge_into(into: &mut VersionData, from: &VersionData) {
    into.content = from.content.clone();
    into.mtime = from.mtime;
    for key in MERGED_ATTRS {
        match from.attrs.get(*key) {
            Some(value) => into.attrs.insert((*key).to_string(), value.clone()),
            None => into.attrs.remove(*key),
        };
    }
}
