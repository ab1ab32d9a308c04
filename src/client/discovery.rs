//! Registry endpoint discovery

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, TaroError};

/// Strategy for locating registry endpoints of job-hosting processes
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn endpoints(&self) -> Result<Vec<PathBuf>>;
}

/// Scans a directory for `*.sock` registry endpoints
#[derive(Debug, Clone)]
pub struct SocketDirDiscovery {
    dir: PathBuf,
}

impl SocketDirDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl EndpointDiscovery for SocketDirDiscovery {
    async fn endpoints(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = format!("{}/*.sock", dir.trim_end_matches('/'));
        let paths = glob::glob(&pattern).map_err(|e| TaroError::Config(format!("Bad endpoint dir: {}", e)))?;

        let mut endpoints: Vec<PathBuf> = paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    log::debug!("Skipping unreadable endpoint entry: {}", e);
                    None
                }
            })
            .collect();
        endpoints.sort();
        Ok(endpoints)
    }
}

/// Fixed list of endpoints
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints {
    endpoints: Vec<PathBuf>,
}

impl StaticEndpoints {
    pub fn new<I, P>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl EndpointDiscovery for StaticEndpoints {
    async fn endpoints(&self) -> Result<Vec<PathBuf>> {
        Ok(self.endpoints.clone())
    }
}
