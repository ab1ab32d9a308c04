//! Append-only JSONL persistence.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{Persistence, RecordIter, RecordQuery};
use crate::domain::InstanceSummary;
use crate::error::{Result, TaroError};

/// One terminal record per line, appended in terminal order.
pub struct JsonlPersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    /// Create a store at the given file path, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for JsonlPersistence {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn append(&self, record: &InstanceSummary) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn query(&self, query: &RecordQuery) -> Result<RecordIter> {
        if !self.path.exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        let file = File::open(&self.path)
            .map_err(|e| TaroError::Persistence(format!("Failed to open {}: {}", self.path.display(), e)))?;
        let query = query.clone();

        let records = BufReader::new(file)
            .lines()
            .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str::<InstanceSummary>(&line).map_err(TaroError::from)
            })
            .filter(move |record| match record {
                Ok(r) => query.matches(r),
                Err(_) => true,
            });
        Ok(Box::new(records))
    }
}
