//! Instance ID generation
//!
//! Instance ids are `{sequence}-{token}`: a per-runner monotonic counter plus a
//! host-local token derived from the process id and a random suffix.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::domain::InstanceId;

/// Generates instance ids that are unique for the lifetime of a runner.
#[derive(Debug)]
pub struct InstanceIdGenerator {
    sequence: AtomicU64,
    token: String,
}

impl InstanceIdGenerator {
    /// Create a generator with a fresh host-local token.
    pub fn new() -> Self {
        Self::with_token(generate_token())
    }

    /// Create a generator with an explicit token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            sequence: AtomicU64::new(1),
            token: token.into(),
        }
    }

    /// The host-local token shared by every id from this generator.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Allocate the next id for `job_id`.
    pub fn next(&self, job_id: &str) -> InstanceId {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        InstanceId::new(job_id, format!("{}-{}", seq, self.token))
    }
}

impl Default for InstanceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a host-local token
///
/// Format: `{pid_hex}{random_hex}`
/// Example: `3f2a09c1`
pub fn generate_token() -> String {
    let random: u16 = rand::rng().random();
    format!("{:x}{:04x}", std::process::id(), random)
}
