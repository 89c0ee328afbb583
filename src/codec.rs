//! # Blob Encoding and Decoding
//!
//! This module owns every byte format wikidb writes that is not a plain SQL
//! column:
//!
//! - attribute maps (`pagedata`, `versiondata`) as stored in SQL text columns
//! - the DBM page record stored under `p:<pagename>`
//! - the DBM session value stored under the session id
//!
//! ## Attribute Blob Format
//!
//! ```text
//! ""                                   empty map
//! {"v":1,"attrs":{"author":"alice"}}   anything else
//! ```
//!
//! The envelope carries a format version so that a future layout can be read
//! side by side with the current one. An empty map is stored as the empty
//! string, which keeps `pagedata = ''` meaningful for placeholder rows.
//!
//! ## DBM Page Record
//!
//! One JSON document per page (see [`StoredPage`]). Every version write
//! rewrites the whole document.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AttrMap, Content, PageData, PageId, RecentPointers, VersionData};

/// Current format version of every JSON envelope written by this module.
pub const FORMAT_VERSION: u32 = 1;

// =============================================================================
// Attribute Maps
// =============================================================================

#[derive(Serialize, Deserialize)]
struct AttrEnvelope {
    v: u32,
    attrs: AttrMap,
}

#[derive(Serialize)]
struct AttrEnvelopeRef<'a> {
    v: u32,
    attrs: &'a AttrMap,
}

/// Encodes an attribute map for storage.
pub fn encode_attrs(attrs: &AttrMap) -> Result<String> {
    if attrs.is_empty() {
        return Ok(String::new());
    }
    serde_json::to_string(&AttrEnvelopeRef {
        v: FORMAT_VERSION,
        attrs,
    })
    .map_err(|e| Error::Corrupt(format!("cannot encode attributes: {e}")))
}

/// Decodes an attribute blob. The empty string decodes to an empty map.
pub fn decode_attrs(blob: &str) -> Result<AttrMap> {
    if blob.is_empty() {
        return Ok(AttrMap::new());
    }
    let envelope: AttrEnvelope = serde_json::from_str(blob)
        .map_err(|e| Error::Corrupt(format!("undecodable attribute blob: {e}")))?;
    check_format(envelope.v)?;
    Ok(envelope.attrs)
}

fn check_format(v: u32) -> Result<()> {
    if v != FORMAT_VERSION {
        return Err(Error::Corrupt(format!(
            "unsupported blob format version {v} (expected {FORMAT_VERSION})"
        )));
    }
    Ok(())
}

// =============================================================================
// DBM Page Records
// =============================================================================

/// One stored revision inside a [`StoredPage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVersion {
    /// Modification time.
    pub mtime: i64,
    /// Minor-edit flag.
    #[serde(default)]
    pub minor: bool,
    /// Full wikitext.
    #[serde(default)]
    pub content: String,
    /// Version attributes.
    #[serde(default)]
    pub attrs: AttrMap,
}

impl StoredVersion {
    /// Builds a stored version from a validated write.
    pub fn from_versiondata(data: &VersionData, content: &str) -> Self {
        Self {
            mtime: data.mtime,
            minor: data.is_minor_edit,
            content: content.to_string(),
            attrs: data.attrs.clone(),
        }
    }

    /// Converts to the public type, with or without the text.
    pub fn to_versiondata(&self, want_content: bool) -> VersionData {
        let content = if want_content {
            Content::Text(self.content.clone())
        } else if self.content.is_empty() {
            Content::Empty
        } else {
            Content::NonEmpty
        };
        VersionData {
            mtime: self.mtime,
            is_minor_edit: self.minor,
            content,
            attrs: self.attrs.clone(),
        }
    }
}

/// The complete DBM record of one page.
///
/// # Derived Fields
///
/// `recent` and `nonempty` are caches of what [`StoredPage::reindex`] computes
/// from `versions`. They are kept in the record so that scans (`most_recent`,
/// `get_all_pages`) don't have to recompute them, and so that `check` can
/// detect drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPage {
    /// Format version.
    pub v: u32,
    /// Internal id.
    pub id: PageId,
    /// Hit counter.
    #[serde(default)]
    pub hits: i64,
    /// Page attributes.
    #[serde(default)]
    pub pagedata: AttrMap,
    /// All revisions by number.
    #[serde(default)]
    pub versions: BTreeMap<u32, StoredVersion>,
    /// Outgoing link targets by id, sorted and deduplicated.
    #[serde(default)]
    pub links: Vec<PageId>,
    /// Cached RecentIndex entry.
    #[serde(default)]
    pub recent: Option<RecentPointers>,
    /// Cached NonEmptyIndex membership.
    #[serde(default)]
    pub nonempty: bool,
}

impl StoredPage {
    /// A fresh placeholder record.
    pub fn new(id: PageId) -> Self {
        Self {
            v: FORMAT_VERSION,
            id,
            hits: 0,
            pagedata: AttrMap::new(),
            versions: BTreeMap::new(),
            links: Vec::new(),
            recent: None,
            nonempty: false,
        }
    }

    /// The derived index values as they should be.
    pub fn computed_index(&self) -> (Option<RecentPointers>, bool) {
        let recent = RecentPointers::compute(self.versions.iter().map(|(v, sv)| (*v, sv.minor)));
        let nonempty = recent
            .and_then(|r| self.versions.get(&r.latest_version))
            .is_some_and(|sv| !sv.content.is_empty());
        (recent, nonempty)
    }

    /// Recomputes the cached `recent`/`nonempty` fields.
    pub fn reindex(&mut self) {
        let (recent, nonempty) = self.computed_index();
        self.recent = recent;
        self.nonempty = nonempty;
    }

    /// Highest version number, 0 if none.
    pub fn latest_version(&self) -> u32 {
        self.versions.keys().next_back().copied().unwrap_or(0)
    }

    /// Page metadata as handed out by reads.
    pub fn page_data(&self) -> PageData {
        PageData {
            hits: self.hits,
            attrs: self.pagedata.clone(),
        }
    }
}

/// Serializes a page record.
pub fn encode_page(page: &StoredPage) -> Result<Vec<u8>> {
    serde_json::to_vec(page).map_err(|e| Error::Corrupt(format!("cannot encode page: {e}")))
}

/// Deserializes a page record.
pub fn decode_page(bytes: &[u8]) -> Result<StoredPage> {
    let page: StoredPage = serde_json::from_slice(bytes)
        .map_err(|e| Error::Corrupt(format!("undecodable page record: {e}")))?;
    check_format(page.v)?;
    Ok(page)
}

// =============================================================================
// DBM Session Values
// =============================================================================

/// A decoded DBM session value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    /// Last write time, seconds.
    pub date: i64,
    /// Client address at the last write.
    pub ip: String,
    /// Opaque session payload.
    pub data: Vec<u8>,
}

/// Encodes a session value.
///
/// ```text
/// [date: i64 LE][ip_len: u16 LE][ip bytes][data bytes]
/// ```
pub fn encode_session(session: &StoredSession) -> Vec<u8> {
    let ip = session.ip.as_bytes();
    let ip = &ip[..ip.len().min(u16::MAX as usize)];
    let mut out = Vec::with_capacity(10 + ip.len() + session.data.len());
    out.extend_from_slice(&session.date.to_le_bytes());
    out.extend_from_slice(&(ip.len() as u16).to_le_bytes());
    out.extend_from_slice(ip);
    out.extend_from_slice(&session.data);
    out
}

/// Decodes a session value written by [`encode_session`].
pub fn decode_session(bytes: &[u8]) -> Result<StoredSession> {
    let corrupt = || Error::Corrupt("truncated session value".into());
    let date_bytes: [u8; 8] = bytes.get(0..8).ok_or_else(corrupt)?.try_into().map_err(|_| corrupt())?;
    let len_bytes: [u8; 2] = bytes.get(8..10).ok_or_else(corrupt)?.try_into().map_err(|_| corrupt())?;
    let ip_len = u16::from_le_bytes(len_bytes) as usize;
    let ip = bytes.get(10..10 + ip_len).ok_or_else(corrupt)?;
    Ok(StoredSession {
        date: i64::from_le_bytes(date_bytes),
        ip: String::from_utf8_lossy(ip).into_owned(),
        data: bytes[10 + ip_len..].to_vec(),
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Returns the current time in seconds since the Unix epoch.
pub fn current_time_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_empty_map_is_empty_string() {
        assert_eq!(encode_attrs(&AttrMap::new()).unwrap(), "");
        assert!(decode_attrs("").unwrap().is_empty());
    }

    #[test]
    fn test_attrs_envelope_shape() {
        let mut attrs = AttrMap::new();
        attrs.insert("author".into(), Value::from("alice"));
        attrs.insert("locked".into(), Value::Bool(true));
        attrs.insert("_supplanted".into(), Value::Int(1_700_000_000));

        let blob = encode_attrs(&attrs).unwrap();
        assert!(blob.starts_with(r#"{"v":1,"attrs":{"#));
        assert_eq!(decode_attrs(&blob).unwrap(), attrs);
    }

    #[test]
    fn test_unknown_format_version_is_corrupt() {
        let err = decode_attrs(r#"{"v":9,"attrs":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));

        let err = decode_attrs("a:1:{s:6:\"author\";}").unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_page_record_reindex() {
        let mut page = StoredPage::new(PageId::from_raw(7));
        page.versions.insert(1, StoredVersion::from_versiondata(&VersionData::new(10, "a"), "a"));
        page.versions.insert(
            2,
            StoredVersion::from_versiondata(&VersionData::new(20, "").minor(true), ""),
        );
        page.reindex();

        let recent = page.recent.unwrap();
        assert_eq!(recent.latest_version, 2);
        assert_eq!(recent.latest_major, Some(1));
        assert_eq!(recent.latest_minor, Some(2));
        assert!(!page.nonempty);

        let decoded = decode_page(&encode_page(&page).unwrap()).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_session_value_layout() {
        let session = StoredSession {
            date: 1_700_000_000,
            ip: "10.0.0.1".into(),
            data: b"user|s:5:\"alice\";".to_vec(),
        };
        let bytes = encode_session(&session);
        assert_eq!(bytes.len(), 10 + 8 + session.data.len());
        assert_eq!(decode_session(&bytes).unwrap(), session);

        assert!(decode_session(&bytes[..5]).is_err());
    }
}
