#![forbid(unsafe_code)]

mod error;

pub use error::QueueError;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use sq_core::{Job, JobUpdate, Patch, SessionKey};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TABLE_NAME: &str = "jobs";

/// Upper bound on waiting for the cross-process exclusive lock. Kept short so
/// a stalled holder cannot wedge the whole fleet; callers retry on
/// `LockTimeout`.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

const REQUIRED_COLUMNS: [&str; 7] = [
    "session",
    "added_ms",
    "priority",
    "started_ms",
    "hostname",
    "finished",
    "error",
];

/// Construction-time configuration for a queue handle.
///
/// `db_path` is expected to live on a filesystem reachable by every worker
/// host. `hostname` identifies this worker in claimed rows; obtaining it is
/// the caller's concern, not the queue's.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub table_name: String,
    pub hostname: String,
}

impl QueueConfig {
    pub fn new(db_path: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            hostname: hostname.into(),
        }
    }
}

/// A persistent job queue over one shared SQLite file.
///
/// Every operation, reads included, runs inside its own `BEGIN EXCLUSIVE`
/// transaction: the database file is the only synchronization point between
/// worker processes, so each operation behaves as if it held a global mutex
/// for its duration.
#[derive(Debug)]
pub struct SqliteJobQueue {
    conn: Connection,
    table_name: String,
    hostname: String,
}

impl SqliteJobQueue {
    /// Open (creating if needed) the queue database and ensure its table.
    ///
    /// Idempotent across calls and processes. Fails fatally if the directory
    /// or connection cannot be set up, or if a pre-existing table lacks a
    /// required column.
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        validate_table_name(&config.table_name)?;

        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.db_path)?;
        conn.busy_timeout(LOCK_TIMEOUT)?;

        // The file may sit on a network share: WAL is off the table, and
        // every commit must reach the disk before the lock is released.
        let mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("delete") {
            return Err(QueueError::InvalidInput(
                "sqlite refused rollback-journal mode",
            ));
        }
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        install_schema(&conn, &config.table_name)?;
        preflight_columns(&conn, &config.table_name)?;

        tracing::debug!(
            path = %config.db_path.display(),
            table = %config.table_name,
            "opened sqlite job queue"
        );

        Ok(Self {
            conn,
            table_name: config.table_name,
            hostname: config.hostname,
        })
    }

    /// Identity recorded into `hostname` when this handle claims a job.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Fetch the job for `key`. `NotFound` if absent; `Ambiguous` if the
    /// uniqueness invariant is broken.
    pub fn get(&mut self, key: &impl SessionKey) -> Result<Job, QueueError> {
        let session = session_of(key)?;
        let tx = begin_exclusive(&mut self.conn)?;
        let job = match get_tx(&tx, &self.table_name, &session)? {
            Some(job) => job,
            None => return Err(QueueError::NotFound { session }),
        };
        tx.commit()?;
        Ok(job)
    }

    /// Insert or fully replace the row for `key`. The job's own `session`
    /// must equal `key`.
    pub fn put(&mut self, key: &impl SessionKey, job: &Job) -> Result<(), QueueError> {
        let session = session_of(key)?;
        let tx = begin_exclusive(&mut self.conn)?;
        put_tx(&tx, &self.table_name, &session, job)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove the row for `key`; absent rows are a no-op, not an error.
    pub fn delete(&mut self, key: &impl SessionKey) -> Result<(), QueueError> {
        let session = session_of(key)?;
        let tx = begin_exclusive(&mut self.conn)?;
        tx.execute(
            &format!("DELETE FROM {} WHERE session=?1", self.table_name),
            params![session],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn contains(&mut self, key: &impl SessionKey) -> Result<bool, QueueError> {
        let session = session_of(key)?;
        let tx = begin_exclusive(&mut self.conn)?;
        let hit = tx
            .query_row(
                &format!("SELECT 1 FROM {} WHERE session=?1", self.table_name),
                params![session],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        tx.commit()?;
        Ok(hit.is_some())
    }

    pub fn len(&mut self) -> Result<u64, QueueError> {
        let tx = begin_exclusive(&mut self.conn)?;
        let count: i64 = tx.query_row(
            &format!("SELECT count(*) FROM {}", self.table_name),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&mut self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all jobs in global order: priority descending, then
    /// `added_ms` ascending, then `session` ascending. Each call re-reads
    /// the table; this is not a live view.
    pub fn jobs(&mut self) -> Result<Vec<Job>, QueueError> {
        let tx = begin_exclusive(&mut self.conn)?;
        let jobs = jobs_tx(&tx, &self.table_name)?;
        tx.commit()?;
        Ok(jobs)
    }

    /// The single mutation primitive: fetch (or default-construct) the job
    /// for `key`, apply `changes`, write it back — all in one exclusive
    /// transaction. Returns the stored job.
    pub fn update(&mut self, key: &impl SessionKey, changes: JobUpdate) -> Result<Job, QueueError> {
        let session = session_of(key)?;
        let tx = begin_exclusive(&mut self.conn)?;
        let mut job = match get_tx(&tx, &self.table_name, &session)? {
            Some(job) => job,
            None => Job::new(session.clone(), now_ms()),
        };
        changes.apply_to(&mut job);
        put_tx(&tx, &self.table_name, &session, &job)?;
        tx.commit()?;
        Ok(job)
    }

    /// Apply `changes`, then requeue — used when (re)submitting a job for
    /// processing regardless of its prior state.
    pub fn add_or_update(
        &mut self,
        key: &impl SessionKey,
        changes: JobUpdate,
    ) -> Result<Job, QueueError> {
        self.update(key, changes)?;
        self.set_queued(key)
    }

    /// Return a job to the unclaimed, eligible-for-selection state: clears
    /// `started_ms`, `hostname`, `finished`, and `error`.
    pub fn set_queued(&mut self, key: &impl SessionKey) -> Result<Job, QueueError> {
        self.update(
            key,
            JobUpdate {
                started_ms: Patch::Clear,
                hostname: Patch::Clear,
                finished: Patch::Clear,
                error: Patch::Clear,
                ..JobUpdate::default()
            },
        )
    }

    /// Claim a job for this worker. Reversible via [`Self::set_queued`].
    pub fn set_started(&mut self, key: &impl SessionKey) -> Result<Job, QueueError> {
        let hostname = self.hostname.clone();
        self.update(
            key,
            JobUpdate {
                started_ms: Patch::Set(now_ms()),
                hostname: Patch::Set(hostname),
                finished: Patch::Set(false),
                ..JobUpdate::default()
            },
        )
    }

    /// Mark a job done. Terminal by convention; nothing technically forbids
    /// requeueing afterwards, so be sure.
    pub fn set_finished(&mut self, key: &impl SessionKey) -> Result<Job, QueueError> {
        self.update(
            key,
            JobUpdate {
                finished: Patch::Set(true),
                ..JobUpdate::default()
            },
        )
    }

    /// Record a failure description without touching the claim fields.
    pub fn set_errored(
        &mut self,
        key: &impl SessionKey,
        error: impl std::fmt::Display,
    ) -> Result<Job, QueueError> {
        self.update(
            key,
            JobUpdate {
                error: Patch::Set(error.to_string()),
                ..JobUpdate::default()
            },
        )
    }

    /// Whether the job is claimed and still in flight (started, not
    /// finished, no recorded error). `NotFound` for unknown keys.
    pub fn is_started(&mut self, key: &impl SessionKey) -> Result<bool, QueueError> {
        Ok(self.get(key)?.is_in_progress())
    }

    /// The next job to process: first job in global order that is not
    /// actively in progress, or `None` when everything is claimed or the
    /// queue is empty.
    pub fn next(&mut self) -> Result<Option<Job>, QueueError> {
        let tx = begin_exclusive(&mut self.conn)?;
        let jobs = jobs_tx(&tx, &self.table_name)?;
        tx.commit()?;
        Ok(jobs.into_iter().find(|job| !job.is_in_progress()))
    }
}

/// The cross-process mutex: `BEGIN EXCLUSIVE`, bounded by the busy timeout.
/// Rollback happens on drop for every non-commit exit path.
fn begin_exclusive(conn: &mut Connection) -> Result<Transaction<'_>, QueueError> {
    conn.transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(map_lock_timeout)
}

fn map_lock_timeout(err: rusqlite::Error) -> QueueError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err
        && matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    {
        return QueueError::LockTimeout;
    }
    QueueError::Sql(err)
}

fn install_schema(conn: &Connection, table: &str) -> Result<(), QueueError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
          session TEXT PRIMARY KEY NOT NULL,
          added_ms INTEGER NOT NULL,
          priority INTEGER NOT NULL DEFAULT 0,
          started_ms INTEGER DEFAULT NULL,
          hostname TEXT DEFAULT NULL,
          finished INTEGER DEFAULT NULL,
          error TEXT DEFAULT NULL
        );
        "#
    ))?;
    Ok(())
}

/// A table may predate this process (another worker, an older build). The
/// row type is fixed at compile time, so the one thing left to verify at
/// construction is that the stored table actually carries every column.
fn preflight_columns(conn: &Connection, table: &str) -> Result<(), QueueError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut present = std::collections::BTreeSet::<String>::new();
    while let Some(row) = rows.next()? {
        present.insert(row.get::<_, String>(1)?);
    }
    for column in REQUIRED_COLUMNS {
        if !present.contains(column) {
            return Err(QueueError::SchemaMismatch { column });
        }
    }
    Ok(())
}

fn get_tx(tx: &Transaction<'_>, table: &str, session: &str) -> Result<Option<Job>, QueueError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT session, added_ms, priority, started_ms, hostname, finished, error \
         FROM {table} WHERE session=?1"
    ))?;
    let mut rows = stmt.query(params![session])?;
    let mut hits = Vec::<Job>::new();
    while let Some(row) = rows.next()? {
        hits.push(read_job_row(row)?);
    }
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.pop()),
        count => Err(QueueError::Ambiguous {
            session: session.to_string(),
            count,
        }),
    }
}

fn put_tx(
    tx: &Transaction<'_>,
    table: &str,
    session: &str,
    job: &Job,
) -> Result<(), QueueError> {
    if job.session != session {
        return Err(QueueError::KeyMismatch {
            key: session.to_string(),
            session: job.session.clone(),
        });
    }
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {table} \
             (session, added_ms, priority, started_ms, hostname, finished, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            job.session,
            job.added_ms,
            job.priority,
            job.started_ms,
            job.hostname,
            job.finished.map(i64::from),
            job.error,
        ],
    )?;
    Ok(())
}

fn jobs_tx(tx: &Transaction<'_>, table: &str) -> Result<Vec<Job>, QueueError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT session, added_ms, priority, started_ms, hostname, finished, error \
         FROM {table} \
         ORDER BY priority DESC, added_ms ASC, session ASC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut jobs = Vec::<Job>::new();
    while let Some(row) = rows.next()? {
        jobs.push(read_job_row(row)?);
    }
    Ok(jobs)
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<Job, rusqlite::Error> {
    let finished: Option<i64> = row.get(5)?;
    Ok(Job {
        session: row.get(0)?,
        added_ms: row.get(1)?,
        priority: row.get(2)?,
        started_ms: row.get(3)?,
        hostname: row.get(4)?,
        finished: finished.map(|value| value != 0),
        error: row.get(6)?,
    })
}

/// Session keys are opaque and pass through byte-for-byte; the one thing a
/// key may not be is blank.
fn session_of(key: &impl SessionKey) -> Result<String, QueueError> {
    let session = key.session();
    if session.trim().is_empty() {
        return Err(QueueError::InvalidInput("session key must not be blank"));
    }
    Ok(session.to_string())
}

/// Table names are interpolated into SQL, so only a conservative identifier
/// shape is accepted.
fn validate_table_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() {
        return Err(QueueError::InvalidInput("table name must not be empty"));
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(QueueError::InvalidInput("table name must not be empty"));
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(QueueError::InvalidInput(
            "table name must start with a letter or underscore",
        ));
    }
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(QueueError::InvalidInput(
                "table name must be ascii alphanumeric or underscore",
            ));
        }
    }
    Ok(())
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("_sorting_v2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("9jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE jobs").is_err());
    }

    #[test]
    fn blank_session_keys_are_rejected_and_others_pass_through() {
        assert!(matches!(
            session_of(&""),
            Err(QueueError::InvalidInput(_))
        ));
        assert!(matches!(
            session_of(&"  "),
            Err(QueueError::InvalidInput(_))
        ));
        assert_eq!(session_of(&"abc").expect("valid key"), "abc");
        assert_eq!(
            session_of(&" abc ").expect("valid key"),
            " abc ",
            "keys are opaque and must not be normalized"
        );
    }

    #[test]
    fn busy_errors_map_to_lock_timeout() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(map_lock_timeout(busy), QueueError::LockTimeout));

        let misuse = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(map_lock_timeout(misuse), QueueError::Sql(_)));
    }
}
