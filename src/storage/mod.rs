//! Persistence of terminal instance records.
//!
//! Backends: append-only JSONL, SQLite, and a disabled backend selected when
//! `persistence.enabled` is false.

mod jsonl;
mod sqlite;
mod traits;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

pub use jsonl::JsonlPersistence;
pub use sqlite::SqlitePersistence;
pub use traits::{Persistence, RecordIter, RecordQuery};

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::domain::InstanceSummary;
use crate::error::{Result, TaroError};

/// Backend used when persistence is disabled. Appends are dropped, queries fail.
#[derive(Debug, Default)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn name(&self) -> &str {
        "disabled"
    }

    fn append(&self, _record: &InstanceSummary) -> Result<()> {
        Ok(())
    }

    fn query(&self, _query: &RecordQuery) -> Result<RecordIter> {
        Err(TaroError::Persistence("persistence disabled".to_string()))
    }
}

/// Open the backend named by the configuration.
pub fn open(config: &PersistenceConfig) -> Result<Arc<dyn Persistence>> {
    if !config.enabled {
        return Ok(Arc::new(NoPersistence));
    }
    let path = config.path();
    log::debug!("Opening {:?} persistence at {}", config.backend, path.display());
    let persistence: Arc<dyn Persistence> = match config.backend {
        PersistenceBackend::Jsonl => Arc::new(JsonlPersistence::new(&path)?),
        PersistenceBackend::Sqlite => Arc::new(SqlitePersistence::open(&path)?),
    };
    Ok(persistence)
}

/// Ordering of `read_jobs` results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortCriteria {
    #[default]
    Created,
    Finished,
    /// Execution time
    Time,
}

impl std::str::FromStr for SortCriteria {
    type Err = TaroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(SortCriteria::Created),
            "finished" => Ok(SortCriteria::Finished),
            "time" => Ok(SortCriteria::Time),
            other => Err(TaroError::Config(format!("unknown sort criteria '{}'", other))),
        }
    }
}

fn compare(a: &InstanceSummary, b: &InstanceSummary, sort: SortCriteria) -> Ordering {
    match sort {
        SortCriteria::Created => a.lifecycle.created_at().cmp(&b.lifecycle.created_at()),
        SortCriteria::Finished => a
            .lifecycle
            .execution_finished()
            .cmp(&b.lifecycle.execution_finished()),
        SortCriteria::Time => a.lifecycle.execution_time().cmp(&b.lifecycle.execution_time()),
    }
}

/// Query, sort and trim stored records.
///
/// With `last`, only the most recently created record of each job is kept.
/// `limit` applies after sorting.
pub fn read_jobs(
    persistence: &dyn Persistence,
    query: &RecordQuery,
    sort: SortCriteria,
    ascending: bool,
    limit: Option<usize>,
    last: bool,
) -> Result<Vec<InstanceSummary>> {
    let mut records = persistence.query(query)?.collect::<Result<Vec<_>>>()?;

    if last {
        records.sort_by(|a, b| compare(b, a, SortCriteria::Created));
        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.id.job_id.clone()));
    }

    records.sort_by(|a, b| {
        let ord = compare(a, b, sort);
        if ascending { ord } else { ord.reverse() }
    });

    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}
