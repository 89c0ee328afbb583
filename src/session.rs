//! # Session Stores
//!
//! Persistent storage for web sessions, next to the page store. A session
//! is an opaque byte payload keyed by its id, stamped with the time and
//! client address of its last write.
//!
//! | Store | Location |
//! |-------|----------|
//! | [`SqlSessionStore`] | `<prefix>session(sess_id, sess_data, sess_date, sess_ip)` |
//! | [`DbmSessionStore`] | `<directory>/<prefix>session.<handler>` |
//!
//! The request-scoped inputs (client address, clock) arrive explicitly as a
//! [`SessionContext`].

use tracing::{debug, info, warn};

use crate::codec::{decode_session, encode_session, StoredSession};
use crate::config::{BackendConfig, BackendKind, Dsn};
use crate::driver::{value_bytes, value_i64, value_string, SqlDriver, SqlValue, SqliteDriver};
use crate::error::{Error, Result};
use crate::kvstore::{KvStore, OpenMode};
use crate::schema::{verify_schema, SESSION_TABLE};

/// File base name of the DBM session store.
pub const SESSION_BASE: &str = "session";

/// Marker preceding the serialized user in a session payload.
const USER_MARKER: &[u8] = b"wiki_user|";

/// Request-scoped inputs of a session write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Client address.
    pub remote_addr: String,
    /// Current time, seconds.
    pub now: i64,
}

/// One row of [`SessionStore::list_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id.
    pub id: String,
    /// Time of the last write.
    pub date: i64,
    /// Client address at the last write.
    pub ip: String,
    /// The serialized user following `wiki_user|` in the payload, if any.
    pub user: Option<String>,
}

impl SessionInfo {
    fn new(id: String, date: i64, ip: String, data: &[u8]) -> Self {
        let user = data
            .windows(USER_MARKER.len())
            .position(|w| w == USER_MARKER)
            .map(|at| String::from_utf8_lossy(&data[at + USER_MARKER.len()..]).into_owned());
        Self { id, date, ip, user }
    }
}

/// Storage for web sessions.
pub trait SessionStore {
    /// The payload of a session, `None` if unknown.
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Creates or replaces a session.
    fn write(&mut self, id: &str, data: &[u8], ctx: &SessionContext) -> Result<()>;

    /// Removes a session. Unknown ids are ignored.
    fn destroy(&mut self, id: &str) -> Result<()>;

    /// Removes sessions last written before `now - max_lifetime_secs`.
    /// Returns how many were removed.
    fn gc(&mut self, max_lifetime_secs: i64, now: i64) -> Result<usize>;

    /// All sessions, most recently written first.
    fn list_active(&self) -> Result<Vec<SessionInfo>>;
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("session id must not be empty".into()));
    }
    Ok(())
}

/// Opens the session store that goes with `config`'s backend.
pub fn open_session_store(config: &BackendConfig) -> Result<Box<dyn SessionStore>> {
    config.validate()?;
    match &config.kind {
        BackendKind::Dbm { .. } => Ok(Box::new(DbmSessionStore::open(config)?)),
        BackendKind::Sql { .. } => Ok(Box::new(SqlSessionStore::<SqliteDriver>::open(config)?)),
    }
}

// =============================================================================
// SQL
// =============================================================================

/// Sessions in the `session` table.
#[derive(Debug)]
pub struct SqlSessionStore<D: SqlDriver> {
    driver: D,
    table: String,
}

impl<D: SqlDriver> SqlSessionStore<D> {
    /// Connects using a SQL `config`. The table must already exist.
    pub fn open(config: &BackendConfig) -> Result<Self> {
        let BackendKind::Sql { dsn } = &config.kind else {
            return Err(Error::Config("not a sql backend configuration".into()));
        };
        let dsn = Dsn::parse(dsn)?;
        let store = Self::with_driver(D::connect(&dsn, config.lock_timeout)?, &config.prefix)?;
        info!(dsn = %dsn, "opened sql session store");
        Ok(store)
    }

    /// Wraps a connection whose session table is already in place.
    pub fn with_driver(driver: D, prefix: &str) -> Result<Self> {
        verify_schema(&driver, prefix, &[SESSION_TABLE])?;
        Ok(Self {
            driver,
            table: format!("{prefix}{SESSION_TABLE}"),
        })
    }
}

impl<D: SqlDriver> SessionStore for SqlSessionStore<D> {
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        validate_id(id)?;
        let value = self.driver.query_value(
            &format!("SELECT sess_data FROM {} WHERE sess_id = ?1", self.table),
            &[SqlValue::Text(id.to_string())],
        )?;
        Ok(value.as_ref().map(value_bytes))
    }

    fn write(&mut self, id: &str, data: &[u8], ctx: &SessionContext) -> Result<()> {
        validate_id(id)?;
        self.driver.execute(
            &format!(
                "INSERT INTO {} (sess_id, sess_data, sess_date, sess_ip) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(sess_id) DO UPDATE SET \
                 sess_data = excluded.sess_data, sess_date = excluded.sess_date, sess_ip = excluded.sess_ip",
                self.table
            ),
            &[
                SqlValue::Text(id.to_string()),
                SqlValue::Blob(data.to_vec()),
                SqlValue::Integer(ctx.now),
                SqlValue::Text(ctx.remote_addr.clone()),
            ],
        )?;
        Ok(())
    }

    fn destroy(&mut self, id: &str) -> Result<()> {
        validate_id(id)?;
        self.driver.execute(
            &format!("DELETE FROM {} WHERE sess_id = ?1", self.table),
            &[SqlValue::Text(id.to_string())],
        )?;
        Ok(())
    }

    fn gc(&mut self, max_lifetime_secs: i64, now: i64) -> Result<usize> {
        let removed = self.driver.execute(
            &format!("DELETE FROM {} WHERE sess_date < ?1", self.table),
            &[SqlValue::Integer(now - max_lifetime_secs)],
        )?;
        debug!(removed, "session gc");
        Ok(removed)
    }

    fn list_active(&self) -> Result<Vec<SessionInfo>> {
        let rows = self.driver.query(
            &format!(
                "SELECT sess_id, sess_date, sess_ip, sess_data FROM {} ORDER BY sess_date DESC, sess_id",
                self.table
            ),
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let col = |i: usize| row.get(i).cloned().unwrap_or(SqlValue::Null);
                SessionInfo::new(
                    value_string(&col(0)),
                    value_i64(&col(1)).unwrap_or(0),
                    value_string(&col(2)),
                    &value_bytes(&col(3)),
                )
            })
            .collect())
    }
}

// =============================================================================
// DBM
// =============================================================================

/// Sessions in their own key/value file, one key per session id.
#[derive(Debug)]
pub struct DbmSessionStore {
    store: KvStore,
}

impl DbmSessionStore {
    /// Opens (creating if needed) the session file of a DBM `config`.
    pub fn open(config: &BackendConfig) -> Result<Self> {
        let (BackendKind::Dbm { handler, .. }, Some(path)) =
            (&config.kind, config.dbm_path(SESSION_BASE))
        else {
            return Err(Error::Config("not a dbm backend configuration".into()));
        };
        let store = KvStore::open(&path, OpenMode::Write, *handler, config.lock_timeout)?;
        info!(path = %path.display(), "opened dbm session store");
        Ok(Self { store })
    }

    /// Every `(id, session)`, in id order. Undecodable values are skipped.
    fn sessions(&self) -> Vec<(Vec<u8>, StoredSession)> {
        let mut out = Vec::new();
        let mut cursor = self.store.first_key();
        while let Some(key) = cursor {
            if let Some(value) = self.store.get(&key) {
                match decode_session(&value) {
                    Ok(session) => out.push((key.clone(), session)),
                    Err(e) => warn!(key = %String::from_utf8_lossy(&key), error = %e, "skipping session"),
                }
            }
            cursor = self.store.next_key(&key);
        }
        out
    }
}

impl SessionStore for DbmSessionStore {
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        validate_id(id)?;
        self.store
            .get(id.as_bytes())
            .map(|value| decode_session(&value).map(|s| s.data))
            .transpose()
    }

    fn write(&mut self, id: &str, data: &[u8], ctx: &SessionContext) -> Result<()> {
        validate_id(id)?;
        let value = encode_session(&StoredSession {
            date: ctx.now,
            ip: ctx.remote_addr.clone(),
            data: data.to_vec(),
        });
        self.store.set(id.as_bytes(), Some(&value))?;
        self.store.sync()
    }

    fn destroy(&mut self, id: &str) -> Result<()> {
        validate_id(id)?;
        self.store.set(id.as_bytes(), None)
    }

    fn gc(&mut self, max_lifetime_secs: i64, now: i64) -> Result<usize> {
        let threshold = now - max_lifetime_secs;
        let expired: Vec<Vec<u8>> = self
            .sessions()
            .into_iter()
            .filter(|(_, s)| s.date < threshold)
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.store.delete(key)?;
        }
        self.store.sync()?;
        debug!(removed = expired.len(), "session gc");
        Ok(expired.len())
    }

    fn list_active(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions()
            .into_iter()
            .map(|(key, s)| SessionInfo::new(String::from_utf8_lossy(&key).into_owned(), s.date, s.ip, &s.data))
            .collect();
        sessions.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }
}
