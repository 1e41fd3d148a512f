//! Handler-facing execution context.
//!
//! Handlers get a narrowed view of the operation surface: they may publish
//! follow-up jobs, flip pause state, and coordinate fan-out child counters,
//! but nothing that takes a lease token. The context carries the job's own
//! id as the default child id so a fan-out worker can simply call
//! `child_ack(key, None)`.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::{OmniqError, Result};
use crate::job::PublishOptions;
use crate::ops::Ops;

/// The safe subset of operations exposed to job handlers.
#[derive(Clone)]
pub struct ExecContext {
    ops: Arc<Ops>,
    default_child_id: String,
}

impl ExecContext {
    pub(crate) fn new(ops: Arc<Ops>, default_child_id: impl Into<String>) -> Self {
        Self {
            ops,
            default_child_id: default_child_id.into(),
        }
    }

    /// The child id used when `child_ack` is called without one; the
    /// current job's id.
    pub fn default_child_id(&self) -> &str {
        &self.default_child_id
    }

    /// Publish a job onto a queue. See [`Ops::publish`].
    pub async fn publish(
        &self,
        queue: &str,
        payload: &JsonValue,
        opts: PublishOptions,
    ) -> Result<String> {
        self.ops.publish(queue, payload, opts).await
    }

    /// Pause a queue.
    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.ops.pause(queue).await
    }

    /// Resume a paused queue.
    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.ops.resume(queue).await
    }

    /// Whether a queue is paused.
    pub async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.ops.is_paused(queue).await
    }

    /// Initialize a fan-out child counter.
    pub async fn childs_init(&self, key: &str, expected: u64) -> Result<()> {
        self.ops.childs_init(key, expected).await
    }

    /// Decrement a child counter, defaulting the child id to the current
    /// job's id. Fails with a validation error when no id is available from
    /// either source.
    pub async fn child_ack(&self, key: &str, child_id: Option<&str>) -> Result<i64> {
        let effective = child_id
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.default_child_id);
        if effective.is_empty() {
            return Err(OmniqError::Validation(
                "child_ack requires a child id or a job-scoped default".into(),
            ));
        }
        self.ops.child_ack(key, effective).await
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("default_child_id", &self.default_child_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_ops, MockStore};

    #[tokio::test]
    async fn test_child_ack_requires_some_id() {
        let store = MockStore::new();
        let ops = Arc::new(mock_ops(&store).await);
        let exec = ExecContext::new(ops, "");

        let err = exec.child_ack("document:doc_1", None).await.unwrap_err();
        assert!(matches!(err, OmniqError::Validation(_)));
    }

    #[tokio::test]
    async fn test_child_ack_uses_default_id() {
        let store = MockStore::new();
        let ops = Arc::new(mock_ops(&store).await);
        let exec = ExecContext::new(ops, "job-42");

        store.push_reply(redis::Value::Array(vec![
            redis::Value::SimpleString("OK".into()),
            redis::Value::Int(2),
        ]));
        let remaining = exec.child_ack("document:doc_1", None).await.unwrap();
        assert_eq!(remaining, 2);

        let args = store
            .calls()
            .into_iter()
            .find_map(|c| match c {
                crate::testing::StoreCall::EvalSha { args, .. } => Some(args),
                _ => None,
            })
            .unwrap();
        assert_eq!(args, vec!["job-42".to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_child_id_wins() {
        let store = MockStore::new();
        let ops = Arc::new(mock_ops(&store).await);
        let exec = ExecContext::new(ops, "job-42");

        store.push_reply(redis::Value::Array(vec![
            redis::Value::SimpleString("OK".into()),
            redis::Value::Int(0),
        ]));
        let remaining = exec.child_ack("document:doc_1", Some("page-9")).await.unwrap();
        assert_eq!(remaining, 0);
    }
}
