//! # Ordered Key/Value File Store
//!
//! The storage engine underneath the DBM backend and the DBM session store:
//! a single file holding an append-only log of key/value records, replayed
//! into an ordered in-memory index on open.
//!
//! ## File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ header (8 bytes): "WKVS" | format | handler | reserved   │
//! ├──────────────────────────────────────────────────────────┤
//! │ record: [crc32][op][key_len][val_len][key][value]        │
//! │ record: ...                                              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - `crc32` (4 bytes LE) covers everything after it in the record
//! - `op` is 1 for put, 2 for delete (delete records carry no value)
//! - lengths are u32 LE
//!
//! ## Crash Tolerance
//!
//! Records are only ever appended. A process that dies mid-write leaves at
//! most one torn record at the end of the file; replay stops at the first
//! record that is short or fails its checksum, and a writer truncates the
//! file back to the last good record.
//!
//! ## Locking
//!
//! Writers take an exclusive OS lock on `<path>.lock`, polling once per
//! second until the configured timeout. The lock dies with its process, so a
//! crashed writer leaves nothing that blocks the next open. Readers take no
//! lock: they replay the file once and keep that snapshot.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::DbmHandler;
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// File magic.
pub const MAGIC: &[u8; 4] = b"WKVS";

/// On-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// `crc32 + op + key_len + val_len`
const RECORD_HEADER_SIZE: usize = 4 + 1 + 4 + 4;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// How often a blocked writer retries the lock file.
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Open Mode
// =============================================================================

/// How a store file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Snapshot read, no lock. The file must exist.
    Read,
    /// Exclusive writer. The file is created if missing.
    Write,
}

// =============================================================================
// Lock File
// =============================================================================

/// An exclusive OS advisory lock on `<path>.lock`.
///
/// The kernel drops the lock when the handle is closed, including when the
/// holding process dies, so a leftover lock file never blocks an open. The
/// file itself stays on disk and only records the last holder's pid.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Takes the lock, retrying once per second for up to `timeout`.
    fn acquire(data_path: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(data_path);
        let open_err = |source: io::Error| Error::StoreOpen {
            path: data_path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(open_err)?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() + LOCK_POLL_INTERVAL > timeout {
                        warn!(path = %data_path.display(), timeout_secs = timeout.as_secs(), "lock wait timed out");
                        return Err(Error::LockTimeout {
                            path: data_path.to_path_buf(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    debug!(path = %path.display(), "store locked by another process, retrying");
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(TryLockError::Error(source)) => return Err(open_err(source)),
            }
        }

        // The pid only helps a human find the holder.
        if let Err(e) = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
        {
            debug!(path = %path.display(), error = %e, "could not record lock holder");
        }
        Ok(Self { path, file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// `<path>.lock`
pub fn lock_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

// =============================================================================
// Record Codec
// =============================================================================

fn encode_record(op: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
    bytes.extend_from_slice(&[0u8; 4]);
    bytes.push(op);
    bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(value);

    // CRC32 over everything after the checksum field
    let checksum = crc32fast::hash(&bytes[4..]);
    bytes[..4].copy_from_slice(&checksum.to_le_bytes());
    bytes
}

/// A decoded record borrowed from the replay buffer.
struct RawRecord<'a> {
    op: u8,
    key: &'a [u8],
    value: &'a [u8],
    len: usize,
}

/// Decodes the record at the start of `bytes`, or `None` if it is torn or
/// fails its checksum.
fn decode_record(bytes: &[u8]) -> Option<RawRecord<'_>> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let stored = read_u32(0);
    let op = bytes[4];
    let key_len = read_u32(5) as usize;
    let val_len = read_u32(9) as usize;
    let len = RECORD_HEADER_SIZE.checked_add(key_len)?.checked_add(val_len)?;
    if len > bytes.len() || !(op == OP_PUT || op == OP_DELETE) {
        return None;
    }
    if crc32fast::hash(&bytes[4..len]) != stored {
        return None;
    }
    let key_start = RECORD_HEADER_SIZE;
    Some(RawRecord {
        op,
        key: &bytes[key_start..key_start + key_len],
        value: &bytes[key_start + key_len..len],
        len,
    })
}

fn encode_header(handler: DbmHandler) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(MAGIC);
    header[4] = FORMAT_VERSION;
    header[5] = handler.id();
    header
}

// =============================================================================
// KvStore
// =============================================================================

/// An open key/value file.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use wikidb::config::DbmHandler;
/// use wikidb::kvstore::{KvStore, OpenMode};
///
/// let mut store = KvStore::open("data/pagedb.gdbm", OpenMode::Write, DbmHandler::Gdbm, Duration::from_secs(20))?;
/// store.set(b"greeting", Some(b"hello"))?;
/// assert_eq!(store.get(b"greeting").as_deref(), Some(&b"hello"[..]));
/// store.close()?;
/// # Ok::<(), wikidb::Error>(())
/// ```
#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    mode: OpenMode,
    handler: DbmHandler,
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Bytes in the file occupied by overwritten or deleted records.
    dead_bytes: u64,
    /// End of the last complete record; the next append goes here.
    end: u64,
    _lock: Option<LockFile>,
}

impl KvStore {
    /// Opens (or in write mode, creates) a store file.
    ///
    /// # Errors
    ///
    /// - [`Error::LockTimeout`] if another writer holds the lock past `timeout`
    /// - [`Error::StoreOpen`] if the file can't be opened or has a bad header
    /// - [`Error::Store`] with `op = "open"` if the file was created for a
    ///   different handler
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        handler: DbmHandler,
        timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source: io::Error| Error::StoreOpen {
            path: path.clone(),
            source,
        };

        let lock = match mode {
            OpenMode::Read => None,
            OpenMode::Write => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(open_err)?;
                }
                Some(LockFile::acquire(&path, timeout)?)
            }
        };

        let mut file = match mode {
            OpenMode::Read => File::open(&path),
            OpenMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path),
        }
        .map_err(open_err)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(open_err)?;

        if bytes.is_empty() {
            if mode == OpenMode::Read {
                return Err(open_err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty store file")));
            }
            file.write_all(&encode_header(handler)).map_err(open_err)?;
            file.sync_data().map_err(open_err)?;
            bytes.extend_from_slice(&encode_header(handler));
            info!(path = %path.display(), handler = %handler, "created store");
        }

        Self::check_header(&path, &bytes, handler)?;

        let mut store = Self {
            path,
            mode,
            handler,
            file,
            index: BTreeMap::new(),
            dead_bytes: 0,
            end: HEADER_SIZE as u64,
            _lock: lock,
        };
        store.replay(&bytes)?;
        Ok(store)
    }

    fn check_header(path: &Path, bytes: &[u8], handler: DbmHandler) -> Result<()> {
        let bad = |msg: String| Error::StoreOpen {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, msg),
        };
        if bytes.len() < HEADER_SIZE || &bytes[..4] != MAGIC {
            return Err(bad("not a wikidb store file".into()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(bad(format!("unsupported store format {}", bytes[4])));
        }
        if bytes[5] != handler.id() {
            let found = DbmHandler::from_id(bytes[5]).map_or_else(|| format!("#{}", bytes[5]), |h| h.to_string());
            return Err(Error::Store {
                op: "open",
                key: path.display().to_string(),
                reason: format!("file was created by handler {found}, not {handler}"),
            });
        }
        Ok(())
    }

    /// Rebuilds the index from the log, truncating a torn tail in write mode.
    fn replay(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = HEADER_SIZE;
        let mut records = 0usize;
        while offset < bytes.len() {
            let Some(record) = decode_record(&bytes[offset..]) else {
                break;
            };
            let previous = match record.op {
                OP_PUT => self.index.insert(record.key.to_vec(), record.value.to_vec()),
                _ => {
                    self.dead_bytes += record.len as u64;
                    self.index.remove(record.key)
                }
            };
            if let Some(old) = previous {
                self.dead_bytes += (RECORD_HEADER_SIZE + record.key.len() + old.len()) as u64;
            }
            offset += record.len;
            records += 1;
        }

        self.end = offset as u64;
        if offset < bytes.len() {
            warn!(
                path = %self.path.display(),
                offset,
                discarded = bytes.len() - offset,
                "discarding torn or corrupt tail of store file"
            );
            if self.mode == OpenMode::Write {
                self.file.set_len(offset as u64)?;
                self.file.sync_data()?;
            }
        }
        debug!(path = %self.path.display(), records, keys = self.index.len(), "replayed store");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mode the store was opened in.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The handler recorded in the file.
    pub fn handler(&self) -> DbmHandler {
        self.handler
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if the store has no keys.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.index.get(key).cloned()
    }

    /// True if the key exists.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// The smallest key, starting a full scan.
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.index.keys().next().cloned()
    }

    /// The smallest key strictly greater than `after`.
    pub fn next_key(&self, after: &[u8]) -> Option<Vec<u8>> {
        self.index
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    /// All keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.scan_prefix(prefix).map(|(k, _)| k.to_vec()).collect()
    }

    /// Iterates `(key, value)` pairs whose key starts with `prefix`, in order.
    pub fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.index
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores `value` under `key`, or deletes the key when `value` is `None`.
    /// Deleting a missing key is a no-op.
    pub fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(value) => self.put(key, value, "set"),
            None if self.exists(key) => self.remove(key, "set"),
            None => Ok(()),
        }
    }

    /// Stores a new key. Fails if the key exists.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.exists(key) {
            return Err(self.store_error("insert", key, "key already exists"));
        }
        self.put(key, value, "insert")
    }

    /// Overwrites an existing key. Fails if the key is missing.
    pub fn replace(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.exists(key) {
            return Err(self.store_error("replace", key, "no such key"));
        }
        self.put(key, value, "replace")
    }

    /// Removes an existing key. Fails if the key is missing.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if !self.exists(key) {
            return Err(self.store_error("delete", key, "no such key"));
        }
        self.remove(key, "delete")
    }

    fn put(&mut self, key: &[u8], value: &[u8], op: &'static str) -> Result<()> {
        self.append(op, key, &encode_record(OP_PUT, key, value))?;
        if let Some(old) = self.index.insert(key.to_vec(), value.to_vec()) {
            self.dead_bytes += (RECORD_HEADER_SIZE + key.len() + old.len()) as u64;
        }
        Ok(())
    }

    fn remove(&mut self, key: &[u8], op: &'static str) -> Result<()> {
        let record = encode_record(OP_DELETE, key, &[]);
        self.append(op, key, &record)?;
        if let Some(old) = self.index.remove(key) {
            self.dead_bytes += (2 * RECORD_HEADER_SIZE + 2 * key.len() + old.len()) as u64;
        }
        Ok(())
    }

    fn append(&mut self, op: &'static str, key: &[u8], record: &[u8]) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(self.store_error(op, key, "store is open read-only"));
        }
        let end = self.end;
        match write_at(&mut self.file, end, record) {
            Ok(()) => {
                self.end += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut off whatever part of the record made it to disk so the
                // next append starts on a record boundary.
                if let Err(trunc) = self.file.set_len(end) {
                    warn!(path = %self.path.display(), error = %trunc, "could not truncate partial record");
                }
                Err(self.store_error(op, key, &e.to_string()))
            }
        }
    }

    fn store_error(&self, op: &'static str, key: &[u8], reason: &str) -> Error {
        let key = String::from_utf8_lossy(key).into_owned();
        warn!(path = %self.path.display(), op, key = %key, reason, "store operation failed");
        Error::Store {
            op,
            key,
            reason: reason.to_string(),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flushes written records to disk.
    pub fn sync(&mut self) -> Result<()> {
        if self.mode == OpenMode::Write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrites the file with only the live records.
    ///
    /// The compacted log is written next to the data file, synced, and then
    /// renamed over it, so a crash leaves either the old or the new file.
    pub fn optimize(&mut self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(self.store_error("optimize", b"", "store is open read-only"));
        }
        let before = self.file.metadata()?.len();

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut buffer = Vec::with_capacity((before - self.dead_bytes.min(before)) as usize);
        buffer.extend_from_slice(&encode_header(self.handler));
        for (key, value) in &self.index {
            buffer.extend_from_slice(&encode_record(OP_PUT, key, value));
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buffer)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.dead_bytes = 0;
        self.end = buffer.len() as u64;
        info!(path = %self.path.display(), before, after = buffer.len(), "compacted store");
        Ok(())
    }

    /// Syncs and releases the store and its lock file.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

/// Writes `record` at `end`, first dropping any bytes past `end` left by an
/// earlier failed write.
fn write_at(file: &mut File, end: u64, record: &[u8]) -> io::Result<()> {
    if file.metadata()?.len() != end {
        file.set_len(end)?;
    }
    file.seek(SeekFrom::Start(end))?;
    file.write_all(record)
}

// =============================================================================
// Tests
// =============================================================================
