//! Persistence trait and query types.

use chrono::{DateTime, Utc};

use crate::domain::{ExecutionState, InstanceSummary};
use crate::error::Result;

/// Lazily evaluated stream of stored records.
pub type RecordIter = Box<dyn Iterator<Item = Result<InstanceSummary>> + Send>;

/// Selection of stored terminal records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Glob over the job id
    pub job: Option<String>,
    /// Created at or after
    pub since: Option<DateTime<Utc>>,
    /// Created strictly before
    pub until: Option<DateTime<Utc>>,
    pub state: Option<ExecutionState>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn job(mut self, pattern: impl Into<String>) -> Self {
        self.job = Some(pattern.into());
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn state(mut self, state: ExecutionState) -> Self {
        self.state = Some(state);
        self
    }

    /// Check if a record matches this query.
    pub fn matches(&self, record: &InstanceSummary) -> bool {
        if let Some(pattern) = &self.job {
            let job_ok = match glob::Pattern::new(pattern) {
                Ok(p) => p.matches(&record.id.job_id),
                Err(_) => *pattern == record.id.job_id,
            };
            if !job_ok {
                return false;
            }
        }
        if let Some(state) = self.state
            && record.state != state
        {
            return false;
        }
        let created = record.lifecycle.created_at();
        if let Some(since) = self.since
            && created.is_none_or(|c| c < since)
        {
            return false;
        }
        if let Some(until) = self.until
            && created.is_none_or(|c| c >= until)
        {
            return false;
        }
        true
    }
}

/// Append-and-query store of terminal instance records.
///
/// `append` is the only mutation and is called exactly once per instance,
/// at its terminal transition.
pub trait Persistence: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn append(&self, record: &InstanceSummary) -> Result<()>;

    fn query(&self, query: &RecordQuery) -> Result<RecordIter>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InstanceId, Lifecycle};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn record(job: &str, state: ExecutionState, created: DateTime<Utc>) -> InstanceSummary {
        let mut lifecycle = Lifecycle::new();
        lifecycle.record(ExecutionState::Created, created).unwrap();
        lifecycle.record(state, created).unwrap();
        InstanceSummary {
            id: InstanceId::new(job, "1-a"),
            state,
            lifecycle,
            exit_code: None,
            failure: None,
            status: None,
            warnings: BTreeMap::new(),
            pid: None,
            command: "true".to_string(),
        }
    }

    #[test]
    fn test_query_all_matches_everything() {
        let r = record("a", ExecutionState::Stopped, Utc::now());
        assert!(RecordQuery::all().matches(&r));
    }

    #[test]
    fn test_query_job_glob() {
        let r = record("db-backup", ExecutionState::Stopped, Utc::now());
        assert!(RecordQuery::all().job("db-*").matches(&r));
        assert!(!RecordQuery::all().job("web*").matches(&r));
    }

    #[test]
    fn test_query_state() {
        let r = record("a", ExecutionState::Failed, Utc::now());
        assert!(RecordQuery::all().state(ExecutionState::Failed).matches(&r));
        assert!(!RecordQuery::all().state(ExecutionState::Stopped).matches(&r));
    }

    #[test]
    fn test_query_time_range() {
        let now = Utc::now();
        let r = record("a", ExecutionState::Stopped, now);
        assert!(RecordQuery::all().since(now - Duration::seconds(1)).matches(&r));
        assert!(!RecordQuery::all().since(now + Duration::seconds(1)).matches(&r));
        assert!(RecordQuery::all().until(now + Duration::seconds(1)).matches(&r));
        assert!(!RecordQuery::all().until(now).matches(&r));
    }
}
