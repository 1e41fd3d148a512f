//! Hash-tagged key layout for queues and child counters.
//!
//! Every key belonging to one queue shares the `{queue}` substring, and every
//! key of one child counter shares `{cc:key}`. Under cluster mode this maps
//! all co-owned keys to a single slot, which keeps the server-side scripts
//! legal. Scripts receive exactly one anchor key and derive the rest by
//! concatenation under the same tag; the client never composes lane keys.

use crate::error::{OmniqError, Result};

/// Maximum length of a child-counter key.
pub const MAX_CHILD_KEY_LEN: usize = 128;

/// Hash-tagged base for all keys of a queue.
///
/// A name that already carries both braces is used verbatim, so callers can
/// pin the slot themselves; anything else is wrapped in `{...}`.
pub fn queue_base(name: &str) -> String {
    if name.contains('{') && name.contains('}') {
        name.to_string()
    } else {
        format!("{{{name}}}")
    }
}

/// The single declared key passed to every queue script.
pub fn queue_anchor(name: &str) -> String {
    format!("{}:meta", queue_base(name))
}

/// Flag key whose existence marks the queue paused.
pub fn paused_key(name: &str) -> String {
    format!("{}:paused", queue_base(name))
}

/// Hash holding one job's record; the `timeout_ms` field is client-readable.
pub fn job_key(name: &str, job_id: &str) -> String {
    format!("{}:job:{}", queue_base(name), job_id)
}

/// The single declared key passed to child-counter scripts.
///
/// The user-supplied key must be non-empty, at most [`MAX_CHILD_KEY_LEN`]
/// characters, and free of braces (which would split the hash tag).
pub fn childs_anchor(key: &str) -> Result<String> {
    validate_child_key(key)?;
    Ok(format!("{{cc:{key}}}:meta"))
}

pub(crate) fn validate_child_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(OmniqError::Validation("child key must not be empty".into()));
    }
    if key.len() > MAX_CHILD_KEY_LEN {
        return Err(OmniqError::Validation(format!(
            "child key exceeds {MAX_CHILD_KEY_LEN} characters"
        )));
    }
    if key.contains('{') || key.contains('}') {
        return Err(OmniqError::Validation(format!(
            "child key must not contain braces: {key:?}"
        )));
    }
    Ok(())
}
