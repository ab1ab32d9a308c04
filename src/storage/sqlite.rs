//! SQLite persistence backend.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params, params_from_iter, types::Value as SqlValue};

use super::traits::{Persistence, RecordIter, RecordQuery};
use crate::domain::InstanceSummary;
use crate::error::{Result, TaroError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS history (
    job_id      TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    created     TEXT NOT NULL,
    finished    TEXT,
    state       TEXT NOT NULL,
    exit_code   INTEGER,
    record      TEXT NOT NULL,
    PRIMARY KEY (job_id, instance_id)
);
CREATE INDEX IF NOT EXISTS history_created ON history (created);
";

/// Rows fetched per round trip while iterating a query
const PAGE_SIZE: usize = 256;

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Terminal records in a single SQLite table.
///
/// `rusqlite::Connection` is not `Sync`, so access goes through a `Mutex`.
/// Query iterators share it and take the lock once per page.
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl std::fmt::Debug for SqlitePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePersistence").finish_non_exhaustive()
    }
}

impl SqlitePersistence {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: PAGE_SIZE,
        })
    }

    /// Number of rows a query iterator fetches per page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Keyset-paginated walk over `history` in insertion order.
struct Pages {
    conn: Arc<Mutex<Connection>>,
    sql: String,
    args: Vec<SqlValue>,
    page_size: usize,
    last_rowid: i64,
    page: VecDeque<Result<InstanceSummary>>,
    exhausted: bool,
}

impl Pages {
    fn fetch(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let mut args = self.args.clone();
        args.push(SqlValue::Integer(self.last_rowid));
        args.push(SqlValue::Integer(self.page_size as i64));

        let mut rows = stmt.query(params_from_iter(args))?;
        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            self.last_rowid = row.get(0)?;
            let json: String = row.get(1)?;
            self.page
                .push_back(serde_json::from_str::<InstanceSummary>(&json).map_err(TaroError::from));
            fetched += 1;
        }
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for Pages {
    type Item = Result<InstanceSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front()
    }
}

impl Persistence for SqlitePersistence {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn append(&self, record: &InstanceSummary) -> Result<()> {
        let created = record
            .lifecycle
            .created_at()
            .ok_or_else(|| TaroError::Persistence(format!("{} has no creation time", record.id)))?;
        let json = serde_json::to_string(record)?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO history (job_id, instance_id, created, finished, state, exit_code, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.job_id,
                record.id.instance_id,
                timestamp(created),
                record.lifecycle.execution_finished().map(timestamp),
                record.state.name(),
                record.exit_code,
                json,
            ],
        )?;
        Ok(())
    }

    fn query(&self, query: &RecordQuery) -> Result<RecordIter> {
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(job) = &query.job {
            clauses.push("job_id GLOB ?");
            args.push(SqlValue::Text(job.clone()));
        }
        if let Some(state) = query.state {
            clauses.push("state = ?");
            args.push(SqlValue::Text(state.name().to_string()));
        }
        if let Some(since) = query.since {
            clauses.push("created >= ?");
            args.push(SqlValue::Text(timestamp(since)));
        }
        if let Some(until) = query.until {
            clauses.push("created < ?");
            args.push(SqlValue::Text(timestamp(until)));
        }
        // bound per page, after the filter arguments
        clauses.push("rowid > ?");

        let sql = format!(
            "SELECT rowid, record FROM history WHERE {} ORDER BY rowid LIMIT ?",
            clauses.join(" AND ")
        );
        Ok(Box::new(Pages {
            conn: Arc::clone(&self.conn),
            sql,
            args,
            page_size: self.page_size,
            last_rowid: 0,
            page: VecDeque::new(),
            exhausted: false,
        }))
    }
}
