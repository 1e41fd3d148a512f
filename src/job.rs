//! Job identifiers, publish options, and operation result types.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job: a ULID, lexicographically sortable by its
/// time component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate a new JobId from the current wall clock.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for publishing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Explicit job id; a fresh ULID when `None`.
    pub job_id: Option<String>,
    /// Maximum number of lease attempts before the job dead-letters (>= 1).
    pub max_attempts: u32,
    /// Lease duration in milliseconds.
    pub timeout_ms: i64,
    /// Base retry delay in milliseconds.
    pub backoff_ms: i64,
    /// Absolute due time in epoch milliseconds; 0 means now.
    pub due_ms: i64,
    /// Group id; empty string means ungrouped.
    pub gid: String,
    /// Per-group concurrency cap; 0 means unlimited / not grouped.
    pub group_limit: u32,
    /// Pins the server's notion of "now" for deterministic testing;
    /// 0 means the local wall clock.
    pub now_ms_override: i64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            max_attempts: 3,
            timeout_ms: 30_000,
            backoff_ms: 5_000,
            due_ms: 0,
            gid: String::new(),
            group_limit: 0,
            now_ms_override: 0,
        }
    }
}

impl PublishOptions {
    /// Set an explicit job id.
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set the maximum number of lease attempts.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the lease duration in milliseconds.
    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Set the base retry delay in milliseconds.
    pub fn backoff_ms(mut self, ms: i64) -> Self {
        self.backoff_ms = ms;
        self
    }

    /// Set an absolute due time in epoch milliseconds.
    pub fn due_ms(mut self, ms: i64) -> Self {
        self.due_ms = ms;
        self
    }

    /// Place the job in a group with the given concurrency cap.
    pub fn group(mut self, gid: impl Into<String>, limit: u32) -> Self {
        self.gid = gid.into();
        self.group_limit = limit;
        self
    }
}

/// A job handed out by `reserve`, together with its lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    /// Job identifier.
    pub id: String,
    /// Original payload JSON text.
    pub payload_raw: String,
    /// Absolute lease expiry in epoch milliseconds.
    pub lock_until_ms: i64,
    /// Attempt counter; 0 on the first lease.
    pub attempt: i64,
    /// Group id; empty string when ungrouped.
    pub gid: String,
    /// Opaque token that must accompany every mutating call on this lease.
    pub lease_token: String,
}

/// Outcome of a `reserve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// No job is ready.
    Empty,
    /// The queue is paused.
    Paused,
    /// A job was leased.
    Job(ReservedJob),
}

/// Outcome of an `ack_fail` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFailOutcome {
    /// The job was rescheduled; it becomes due at `due_ms`.
    Retry { due_ms: i64 },
    /// Attempts are exhausted; the job moved to the failed set.
    Failed,
}

/// Per-job result of a batch retry/remove operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemStatus {
    /// Job identifier the status refers to.
    pub job_id: String,
    /// Whether the operation succeeded for this job.
    pub ok: bool,
    /// Failure reason when `ok` is false (e.g. `NOT_FOUND`).
    pub reason: Option<String>,
}

/// A queue lane that administrative retry/remove operations may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Ungrouped FIFO of ready jobs.
    Ready,
    /// Jobs scheduled for a future due time.
    Delayed,
    /// Dead-lettered jobs.
    Failed,
}

impl Lane {
    /// Wire name of the lane, as the server scripts expect it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Ready => "ready",
            Lane::Delayed => "delayed",
            Lane::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_is_ulid() {
        let id = JobId::new().to_string();
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_successive_ids_sort_by_time() {
        let a = JobId::new().to_string();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = JobId::new().to_string();
        assert!(a < b);
    }

    #[test]
    fn test_publish_defaults() {
        let opts = PublishOptions::default();
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.timeout_ms, 30_000);
        assert_eq!(opts.backoff_ms, 5_000);
        assert_eq!(opts.due_ms, 0);
        assert!(opts.gid.is_empty());
        assert_eq!(opts.group_limit, 0);
        assert_eq!(opts.now_ms_override, 0);
    }

    #[test]
    fn test_now_ms_is_reasonable() {
        // After 2020-01-01 in milliseconds.
        assert!(now_ms() > 1_577_836_800_000);
    }
}
