//! # Domain Types for wikidb
//!
//! This module defines the core types shared by every backend: page ids,
//! attribute maps, page and version data, and the records handed out by
//! [`PageIterator`](crate::iterator::PageIterator).
//!
//! ## Design Philosophy: Typed Where It Matters, Open Where It Must Be
//!
//! The storage core only interprets a handful of fields (`hits`, `mtime`,
//! `is_minor_edit`, content). Everything else callers attach to a page or a
//! version (owner, locking flag, author, summary, markup format, ...) lives in
//! an open [`AttrMap`] that the store round-trips without looking inside,
//! except for the two keys the retention policy reads ([`ATTR_AUTHOR`] and
//! [`ATTR_SUPPLANTED`]).
//!
//! ## Invariants
//!
//! - [`PageId`]: assigned once per page, never reused, even after deletion
//! - Version numbers: positive, unique per page, chosen by the writer
//! - [`Content::Empty`] and `Content::Text("")` both mean "deleted"

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Well-Known Attribute Keys
// =============================================================================

/// Version attribute naming the revision's author. Drives the author
/// retention class and the minor-edit merge rule.
pub const ATTR_AUTHOR: &str = "author";

/// Version attribute holding the edit summary.
pub const ATTR_SUMMARY: &str = "summary";

/// Version attribute holding the time (seconds) at which the revision
/// stopped being the current one. Written by
/// [`WikiDb::create_revision`](crate::wikidb::WikiDb::create_revision).
pub const ATTR_SUPPLANTED: &str = "_supplanted";

/// Page attribute holding the hit counter. Stored in its own column/field,
/// never inside the serialized pagedata.
pub const ATTR_HITS: &str = "hits";

/// Pseudo-attributes accepted by `update_versiondata` for the typed fields.
pub const ATTR_MTIME: &str = "mtime";
/// See [`ATTR_MTIME`].
pub const ATTR_IS_MINOR_EDIT: &str = "is_minor_edit";

// =============================================================================
// Page Identification
// =============================================================================

/// Internal surrogate key of a page.
///
/// # Invariants
///
/// - Stable for the page's lifetime, including across renames
/// - Never reused once assigned
///
/// Link edges are stored by id, which is why renaming a page keeps every
/// incoming link pointing at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(i64);

impl PageId {
    /// Creates a PageId from a raw value read from storage.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejects the empty pagename. Every backend operation that takes a name
/// calls this first.
pub fn validate_pagename(pagename: &str) -> Result<()> {
    if pagename.is_empty() {
        return Err(Error::InvalidArgument("pagename must not be empty".into()));
    }
    Ok(())
}

/// Rejects version 0, which is the "no version" sentinel.
pub fn validate_version(version: u32) -> Result<()> {
    if version == 0 {
        return Err(Error::InvalidArgument("version numbers start at 1".into()));
    }
    Ok(())
}

// =============================================================================
// Attribute Values
// =============================================================================

/// A single attribute value: string, integer or boolean.
///
/// # Rust Pattern: Untagged Enum
///
/// `#[serde(untagged)]` lets the JSON encoding stay natural (`true`, `42`,
/// `"text"`) instead of `{"Int":42}`. Variant order matters for decoding:
/// booleans and integers are tried before strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A boolean flag (`locked`, ...).
    Bool(bool),
    /// An integer (`hits`, `_supplanted`, ...).
    Int(i64),
    /// Free text (`author`, `summary`, ...).
    Str(String),
}

impl Value {
    /// True for the values an update uses to remove a key: `""`, `"0"`, `0`
    /// and `false`.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Str(s) => s.is_empty() || s == "0",
        }
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view. Numeric strings are accepted because older data may
    /// have stored counters as text.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Truthiness in the usual wiki sense (non-empty).
    pub fn as_bool(&self) -> bool {
        !self.is_empty()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// An open, ordered, string-keyed attribute map.
///
/// `BTreeMap` rather than `HashMap` so that the encoded blob is byte-stable
/// for equal maps.
pub type AttrMap = BTreeMap<String, Value>;

/// Merges `update` into `target`: empty values remove the key, everything
/// else overwrites.
pub fn merge_attrs(target: &mut AttrMap, update: &AttrMap) {
    for (key, value) in update {
        if value.is_empty() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

// =============================================================================
// Page Data
// =============================================================================

/// Page-level metadata: the decoded pagedata blob plus the hit counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageData {
    /// Cached hit count (stored separately so it can be bumped cheaply).
    pub hits: i64,
    /// Everything else (owner, locked flag, permissions, ...).
    pub attrs: AttrMap,
}

impl PageData {
    /// Looks up a page attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// True for a placeholder: no attributes and no hits.
    pub fn is_blank(&self) -> bool {
        self.hits == 0 && self.attrs.is_empty()
    }
}

// =============================================================================
// Version Data
// =============================================================================

/// The content of a version as returned by a read.
///
/// # Why Three States?
///
/// `get_versiondata(.., want_content = false)` must still say whether the
/// content is empty without shipping the (possibly large) text. Those reads
/// return [`Content::NonEmpty`] or [`Content::Empty`]; full reads return
/// [`Content::Text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// The full wikitext.
    Text(String),
    /// Content exists and is non-empty, text not loaded.
    NonEmpty,
    /// Content is the empty string (the page was blanked/deleted).
    Empty,
}

impl Content {
    /// True if this version counts as "deleted".
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::NonEmpty => false,
            Content::Empty => true,
        }
    }

    /// The text, if it was loaded.
    pub fn text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Drops the text, keeping only the empty/non-empty bit.
    pub fn summarize(&self) -> Content {
        if self.is_empty() {
            Content::Empty
        } else {
            Content::NonEmpty
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

/// One revision of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionData {
    /// Modification time, seconds since the epoch. Must be positive.
    pub mtime: i64,
    /// Whether the author flagged this as a minor edit.
    pub is_minor_edit: bool,
    /// The wikitext (or just its emptiness, see [`Content`]).
    pub content: Content,
    /// Author, summary, markup format, `_supplanted`, caller extensions.
    pub attrs: AttrMap,
}

impl VersionData {
    /// A major edit with the given time and text and no attributes.
    pub fn new(mtime: i64, content: impl Into<Content>) -> Self {
        Self {
            mtime,
            is_minor_edit: false,
            content: content.into(),
            attrs: AttrMap::new(),
        }
    }

    /// Sets the minor-edit flag.
    pub fn minor(mut self, is_minor_edit: bool) -> Self {
        self.is_minor_edit = is_minor_edit;
        self
    }

    /// Adds an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// The revision's author, if recorded and non-empty.
    pub fn author(&self) -> Option<&str> {
        self.attrs
            .get(ATTR_AUTHOR)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The supplanted timestamp, if recorded.
    pub fn supplanted(&self) -> Option<i64> {
        self.attrs.get(ATTR_SUPPLANTED).and_then(Value::as_int)
    }

    /// Checks the invariants required for a write and returns the text.
    ///
    /// A write needs a positive `mtime` and the actual text; the
    /// `NonEmpty`/`Empty` markers only make sense on the read side (an
    /// `Empty` marker is accepted as the empty string).
    pub fn text_for_write(&self) -> Result<&str> {
        if self.mtime <= 0 {
            return Err(Error::InvalidArgument(format!(
                "mtime must be positive, got {}",
                self.mtime
            )));
        }
        match &self.content {
            Content::Text(s) => Ok(s),
            Content::Empty => Ok(""),
            Content::NonEmpty => Err(Error::InvalidArgument(
                "cannot write a version without its content text".into(),
            )),
        }
    }
}

// =============================================================================
// Derived Index Entries
// =============================================================================

/// The RecentIndex row for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentPointers {
    /// Highest version number.
    pub latest_version: u32,
    /// Highest version number with `is_minor_edit == false`.
    pub latest_major: Option<u32>,
    /// Highest version number with `is_minor_edit == true`.
    pub latest_minor: Option<u32>,
}

impl RecentPointers {
    /// Computes the pointers from `(version, is_minor_edit)` pairs.
    /// Returns `None` when there are no versions.
    pub fn compute(versions: impl IntoIterator<Item = (u32, bool)>) -> Option<Self> {
        let mut result: Option<Self> = None;
        for (version, minor) in versions {
            let entry = result.get_or_insert(Self {
                latest_version: version,
                latest_major: None,
                latest_minor: None,
            });
            entry.latest_version = entry.latest_version.max(version);
            let slot = if minor {
                &mut entry.latest_minor
            } else {
                &mut entry.latest_major
            };
            *slot = Some(slot.map_or(version, |v| v.max(version)));
        }
        result
    }
}

// =============================================================================
// Iterator Records
// =============================================================================

/// One row produced by a [`PageIterator`](crate::iterator::PageIterator).
///
/// `version`/`versiondata` are present when the underlying query joined
/// version rows (recent changes, full-text search).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    /// The page name.
    pub pagename: String,
    /// Decoded pagedata plus hits.
    pub pagedata: PageData,
    /// Version number of the joined version row.
    pub version: Option<u32>,
    /// The joined version row.
    pub versiondata: Option<VersionData>,
}

impl PageRecord {
    /// A record without version data.
    pub fn page(pagename: impl Into<String>, pagedata: PageData) -> Self {
        Self {
            pagename: pagename.into(),
            pagedata,
            version: None,
            versiondata: None,
        }
    }
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Sortable columns for page listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    /// By name.
    Pagename,
    /// By hit count.
    Hits,
    /// By modification time of the latest version.
    Mtime,
}

/// A sort order: field plus direction.
///
/// # Parsing
///
/// Accepts the list-widget syntax: `"pagename"` or `"+pagename"` ascending,
/// `"-mtime"` descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortBy {
    /// The column.
    pub field: SortField,
    /// Direction.
    pub descending: bool,
}

impl SortBy {
    /// Ascending by `field`.
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Descending by `field`.
    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    /// Applies the direction to an ascending comparison.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

impl FromStr for SortBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (descending, name) = match s.trim() {
            rest if rest.starts_with('-') => (true, &rest[1..]),
            rest if rest.starts_with('+') => (false, &rest[1..]),
            rest => (false, rest),
        };
        let field = match name.to_ascii_lowercase().as_str() {
            "pagename" => SortField::Pagename,
            "hits" => SortField::Hits,
            "mtime" => SortField::Mtime,
            other => {
                return Err(Error::InvalidArgument(format!("unknown sort column '{other}'")))
            }
        };
        Ok(Self { field, descending })
    }
}

/// Parameters for `most_recent` (recent changes).
///
/// # Selection
///
/// | include_all | exclude_major | include_minor | rows |
/// |---|---|---|---|
/// | no | yes | - | latest minor revision per page |
/// | no | no | no | latest major revision per page |
/// | no | no | yes | latest revision per page |
/// | yes | yes | - | every minor revision |
/// | yes | no | no | every major revision |
/// | yes | no | yes | every revision |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentQuery {
    /// Only versions with `mtime >= since`.
    pub since: Option<i64>,
    /// Row cap; negative reverses the order (oldest first). Zero = unlimited.
    pub limit: i64,
    /// Include minor revisions.
    pub include_minor_revisions: bool,
    /// Only minor revisions.
    pub exclude_major_revisions: bool,
    /// Every historical revision instead of one per page.
    pub include_all_revisions: bool,
}

impl RecentQuery {
    /// Latest major revision of each page, newest first, unlimited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `since` floor.
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the limit.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Includes minor revisions.
    pub fn include_minor(mut self) -> Self {
        self.include_minor_revisions = true;
        self
    }

    /// Restricts to minor revisions.
    pub fn only_minor(mut self) -> Self {
        self.exclude_major_revisions = true;
        self
    }

    /// Returns every revision, not just the latest per page.
    pub fn all_revisions(mut self) -> Self {
        self.include_all_revisions = true;
        self
    }

    /// True if a version with this flag is selected by the major/minor filter.
    pub fn wants(&self, is_minor_edit: bool) -> bool {
        if self.exclude_major_revisions {
            is_minor_edit
        } else if !self.include_minor_revisions {
            !is_minor_edit
        } else {
            true
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_emptiness() {
        assert!(Value::from("").is_empty());
        assert!(Value::from("0").is_empty());
        assert!(Value::from(0).is_empty());
        assert!(Value::from(false).is_empty());
        assert!(!Value::from("admin").is_empty());
        assert!(!Value::from(true).is_empty());
    }

    #[test]
    fn test_merge_attrs_removes_empty_values() {
        let mut target = AttrMap::new();
        target.insert("locked".into(), Value::Bool(true));
        target.insert("owner".into(), Value::from("alice"));

        let mut update = AttrMap::new();
        update.insert("locked".into(), Value::Bool(false));
        update.insert("perm".into(), Value::from("edit"));
        merge_attrs(&mut target, &update);

        assert!(!target.contains_key("locked"));
        assert_eq!(target.get("owner"), Some(&Value::from("alice")));
        assert_eq!(target.get("perm"), Some(&Value::from("edit")));
    }

    #[test]
    fn test_recent_pointers_compute() {
        assert_eq!(RecentPointers::compute(Vec::new()), None);

        let pointers = RecentPointers::compute(vec![(1, false), (3, true), (2, false)]).unwrap();
        assert_eq!(pointers.latest_version, 3);
        assert_eq!(pointers.latest_major, Some(2));
        assert_eq!(pointers.latest_minor, Some(3));
    }

    #[test]
    fn test_sort_by_parse() {
        assert_eq!("pagename".parse::<SortBy>().unwrap(), SortBy::asc(SortField::Pagename));
        assert_eq!("+hits".parse::<SortBy>().unwrap(), SortBy::asc(SortField::Hits));
        assert_eq!("-mtime".parse::<SortBy>().unwrap(), SortBy::desc(SortField::Mtime));
        assert!("-colour".parse::<SortBy>().is_err());
    }

    #[test]
    fn test_text_for_write_validates() {
        assert!(VersionData::new(0, "x").text_for_write().is_err());
        assert_eq!(VersionData::new(5, "x").text_for_write().unwrap(), "x");

        let mut marker = VersionData::new(5, "x");
        marker.content = Content::NonEmpty;
        assert!(marker.text_for_write().is_err());
    }

    #[test]
    fn test_recent_query_filter() {
        let majors = RecentQuery::new();
        assert!(majors.wants(false));
        assert!(!majors.wants(true));

        let minors = RecentQuery::new().only_minor();
        assert!(minors.wants(true));
        assert!(!minors.wants(false));

        let everything = RecentQuery::new().include_minor();
        assert!(everything.wants(true) && everything.wants(false));
    }
}
