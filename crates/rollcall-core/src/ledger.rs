//! SQLite-backed attendance ledger.
//!
//! Holds identities, sessions and attendance records. Exactly-once attendance
//! per (identity, session) is a `UNIQUE` constraint in the schema; the
//! application never relies on a prior read to enforce it. Every write runs in
//! its own transaction, which rolls back when dropped on any error path.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        id   INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS sessions (
        id         INTEGER PRIMARY KEY,
        name       TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id          INTEGER PRIMARY KEY,
        identity_id INTEGER NOT NULL REFERENCES identities(id),
        session_id  INTEGER NOT NULL REFERENCES sessions(id),
        marked_at   TEXT NOT NULL,
        CONSTRAINT uix_identity_session UNIQUE (identity_id, session_id)
    );
";

/// How long a write waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session {0} does not exist")]
    UnknownSession(SessionId),
    #[error("session name must not be empty")]
    EmptySessionName,
    #[error("identity name must not be empty")]
    EmptyIdentity,
    #[error("stored timestamp {0:?} is not RFC 3339")]
    BadTimestamp(String),
    #[error("ledger I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger connection lock poisoned")]
    Poisoned,
}

/// Row id of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful [`Ledger::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
}

/// Identities × sessions presence grid.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttendanceReport {
    /// Sessions in creation order.
    pub sessions: Vec<Session>,
    /// One row per identity, sorted by name.
    pub rows: Vec<AttendanceRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub identity: String,
    /// `present[i]` refers to `sessions[i]`.
    pub present: Vec<bool>,
}

impl AttendanceReport {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() || self.rows.is_empty()
    }
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) the ledger database at `path`.
    ///
    /// Several processes may share the file; writes wait up to
    /// `BUSY_TIMEOUT` for each other instead of failing with `SQLITE_BUSY`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        tracing::debug!(path = %path.display(), "opened attendance ledger");
        Self::init(conn)
    }

    /// In-memory ledger (tests and dry runs).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Write transactions take the database write lock up front, so a
    /// concurrent writer is waited for rather than reported as a stale snapshot.
    fn write_tx(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
    }

    /// Create a session, or return the id of the existing session with that name.
    pub fn create_session(&self, name: &str) -> Result<SessionId, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::EmptySessionName);
        }
        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn)?;
        let inserted = tx.execute(
            "INSERT INTO sessions (name, created_at) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![name, Utc::now().to_rfc3339()],
        )?;
        let id: i64 = tx.query_row("SELECT id FROM sessions WHERE name = ?1", [name], |r| r.get(0))?;
        tx.commit()?;

        let id = SessionId(id);
        if inserted == 1 {
            tracing::info!(session = %id, name, "created session");
        } else {
            tracing::info!(session = %id, name, "reusing existing session");
        }
        Ok(id)
    }

    pub fn session(&self, id: SessionId) -> Result<Option<Session>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, created_at FROM sessions WHERE id = ?1",
            [id.0],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
        )
        .optional()?
        .map(session_from_row)
        .transpose()
    }

    /// Record `identity` as present in `session`.
    ///
    /// Creates the identity if it is not yet known. A uniqueness violation on
    /// the attendance insert is reported as [`MarkOutcome::AlreadyMarked`].
    pub fn mark(&self, session: SessionId, identity: &str) -> Result<MarkOutcome, LedgerError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(LedgerError::EmptyIdentity);
        }
        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn)?;

        let session_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
            [session.0],
            |r| r.get(0),
        )?;
        if !session_exists {
            return Err(LedgerError::UnknownSession(session));
        }

        let identity_id = upsert_identity(&tx, identity)?;
        let inserted = tx.execute(
            "INSERT INTO attendance (identity_id, session_id, marked_at) VALUES (?1, ?2, ?3)",
            params![identity_id, session.0, Utc::now().to_rfc3339()],
        );
        match inserted {
            Ok(_) => {
                tx.commit()?;
                tracing::info!(%session, identity, "attendance marked");
                Ok(MarkOutcome::Marked)
            }
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                tracing::debug!(%session, identity, "attendance already marked");
                Ok(MarkOutcome::AlreadyMarked)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn identity_exists(&self, name: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE name = ?1)",
            [name.trim()],
            |r| r.get(0),
        )?)
    }

    /// All identity names, sorted.
    pub fn identities(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM identities ORDER BY name")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Create any of `names` that do not exist yet.
    pub fn ensure_identities<S: AsRef<str>>(&self, names: &[S]) -> Result<usize, LedgerError> {
        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn)?;
        let mut created = 0;
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            created += tx.execute(
                "INSERT INTO identities (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                [name],
            )?;
        }
        tx.commit()?;
        if created > 0 {
            tracing::info!(created, "seeded default identities");
        }
        Ok(created)
    }

    /// Create a brand-new identity and run `work` inside the same transaction.
    ///
    /// Returns `Ok(None)` without calling `work` if the identity already
    /// exists. The identity row is committed only if `work` succeeds; on error
    /// the transaction is rolled back and the error returned. The ledger is
    /// locked for the duration of `work`, which must not call back into it.
    pub fn register_identity<T, E>(
        &self,
        name: &str,
        work: impl FnOnce() -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<LedgerError>,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::EmptyIdentity.into());
        }
        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn).map_err(LedgerError::from)?;
        let inserted = tx
            .execute(
                "INSERT INTO identities (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                [name],
            )
            .map_err(LedgerError::from)?;
        if inserted == 0 {
            return Ok(None);
        }

        let value = work()?;
        tx.commit().map_err(LedgerError::from)?;
        tracing::info!(identity = name, "registered identity");
        Ok(Some(value))
    }

    /// Identities marked present in `session`, sorted by name.
    pub fn attendees(&self, session: SessionId) -> Result<Vec<String>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT i.name FROM attendance a
             JOIN identities i ON i.id = a.identity_id
             WHERE a.session_id = ?1
             ORDER BY i.name",
        )?;
        let names = stmt
            .query_map([session.0], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Number of attendance rows for one (identity, session) pair.
    pub fn attendance_count(&self, session: SessionId, identity: &str) -> Result<usize, LedgerError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance a
             JOIN identities i ON i.id = a.identity_id
             WHERE a.session_id = ?1 AND i.name = ?2",
            params![session.0, identity],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Presence of every identity in every session.
    pub fn attendance_report(&self) -> Result<AttendanceReport, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT id, name FROM identities ORDER BY name")?;
        let identities = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt =
            conn.prepare("SELECT id, name, created_at FROM sessions ORDER BY created_at, id")?;
        let sessions = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT identity_id, session_id FROM attendance")?;
        let present = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<HashSet<_>, _>>()?;

        let rows = identities
            .into_iter()
            .map(|(identity_id, identity)| AttendanceRow {
                identity,
                present: sessions
                    .iter()
                    .map(|s| present.contains(&(identity_id, s.id.0)))
                    .collect(),
            })
            .collect();

        Ok(AttendanceReport { sessions, rows })
    }
}

fn upsert_identity(tx: &Transaction<'_>, name: &str) -> Result<i64, LedgerError> {
    tx.execute(
        "INSERT INTO identities (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        [name],
    )?;
    Ok(tx.query_row("SELECT id FROM identities WHERE name = ?1", [name], |r| r.get(0))?)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn session_from_row((id, name, created_at): (i64, String, String)) -> Result<Session, LedgerError> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|_| LedgerError::BadTimestamp(created_at.clone()))?
        .with_timezone(&Utc);
    Ok(Session {
        id: SessionId(id),
        name,
        created_at,
    })
}
