//! Error types for the omniq client library.

use thiserror::Error;

/// Reply reasons that mean the current lease is gone: the job was reaped or
/// re-reserved by someone else. The heartbeater treats these as terminal for
/// the job it is guarding; everything else is transient.
pub const LEASE_LOSS_REASONS: [&str; 2] = ["NOT_ACTIVE", "TOKEN_MISMATCH"];

/// The main error type for the omniq library.
#[derive(Error, Debug)]
pub enum OmniqError {
    /// Fatal at client creation: missing scripts directory or script file.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal at the call site: bad payload type, empty child id, oversized batch.
    #[error("validation error: {0}")]
    Validation(String),

    /// The store replied with a shape the client does not understand.
    /// The message carries the raw reply for diagnosis.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A server-side script refused the operation (`["ERR", reason]`).
    /// Callers may match on the reason substring (`NOT_ACTIVE`,
    /// `TOKEN_MISMATCH`, `BAD_STATE`, ...).
    #[error("{op} failed: {reason}")]
    Script { op: String, reason: String },

    /// Redis connection or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OmniqError {
    /// Build a script error for the given operation, uppercasing the name
    /// so the message reads `RESERVE failed: ...`.
    pub(crate) fn script(op: &str, reason: impl Into<String>) -> Self {
        Self::Script {
            op: op.to_ascii_uppercase(),
            reason: reason.into(),
        }
    }

    /// True when the store rejected an `EVALSHA` because the script cache
    /// no longer holds the script. Detection is by message substring; the
    /// wire-stable part of the reply across server variants.
    pub fn is_noscript(&self) -> bool {
        self.to_string().to_ascii_lowercase().contains("noscript")
    }

    /// True when the error means the lease backing the current job is gone.
    pub fn is_lease_loss(&self) -> bool {
        let msg = self.to_string();
        LEASE_LOSS_REASONS.iter().any(|r| msg.contains(r))
    }
}

/// Result type alias using OmniqError.
pub type Result<T> = std::result::Result<T, OmniqError>;
