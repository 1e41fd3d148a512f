//! Test utilities: an in-memory [`MockStore`] with scripted replies.
//!
//! The mock implements [`Store`] so the operations layer and the consumer
//! runloop can be exercised without a server. Replies for `EVAL`/`EVALSHA`
//! are queued in order with [`MockStore::push_reply`]; every call is
//! recorded and can be inspected afterwards.
//!
//! ```rust,ignore
//! use omniq::testing::MockStore;
//! use redis::Value;
//!
//! let store = MockStore::new();
//! store.push_reply(Value::Array(vec![Value::SimpleString("EMPTY".into())]));
//! // ... run an op against the store, then:
//! assert_eq!(store.evalsha_count(), 1);
//! ```

use async_trait::async_trait;
use redis::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::error::{OmniqError, Result};
use crate::store::Store;

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `EVAL source keys args`.
    Eval {
        /// Script source.
        source: String,
        /// Declared keys.
        keys: Vec<String>,
        /// Positional arguments.
        args: Vec<String>,
    },
    /// `EVALSHA sha keys args`.
    EvalSha {
        /// Script SHA.
        sha: String,
        /// Declared keys.
        keys: Vec<String>,
        /// Positional arguments.
        args: Vec<String>,
    },
    /// `SCRIPT LOAD`.
    ScriptLoad {
        /// Script source.
        source: String,
    },
    /// `EXISTS key`.
    Exists(String),
    /// `HGET key field`.
    HGet(String, String),
}

#[derive(Default)]
struct MockStoreInner {
    replies: VecDeque<Result<Value>>,
    calls: Vec<StoreCall>,
    known_shas: HashSet<String>,
    existing_keys: HashSet<String>,
    hash_fields: HashMap<(String, String), String>,
}

/// In-memory store fake with scripted replies and a call log.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockStore {
    /// Create an empty mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next `EVAL`/`EVALSHA` reply.
    pub fn push_reply(&self, value: Value) {
        self.inner.lock().unwrap().replies.push_back(Ok(value));
    }

    /// Queue the next `EVAL`/`EVALSHA` call to fail with the given message.
    pub fn push_error(&self, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .replies
            .push_back(Err(OmniqError::Protocol(message.into())));
    }

    /// Forget every registered script, as `SCRIPT FLUSH` on a real server
    /// would. Subsequent `EVALSHA` calls fail with a NOSCRIPT error until
    /// the script is re-registered via `SCRIPT LOAD` or `EVAL`.
    pub fn flush_scripts(&self) {
        self.inner.lock().unwrap().known_shas.clear();
    }

    /// Mark a key as existing for `EXISTS`.
    pub fn set_exists(&self, key: impl Into<String>) {
        self.inner.lock().unwrap().existing_keys.insert(key.into());
    }

    /// Set a hash field for `HGET`.
    pub fn set_hash_field(
        &self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .hash_fields
            .insert((key.into(), field.into()), value.into());
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of `EVAL` calls seen.
    pub fn eval_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::Eval { .. }))
    }

    /// Number of `EVALSHA` calls seen.
    pub fn evalsha_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::EvalSha { .. }))
    }

    /// Number of `SCRIPT LOAD` calls seen.
    pub fn script_load_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::ScriptLoad { .. }))
    }

    fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| pred(c))
            .count()
    }

    fn pop_reply(&self, context: &str) -> Result<Value> {
        self.inner
            .lock()
            .unwrap()
            .replies
            .pop_front()
            .unwrap_or_else(|| {
                Err(OmniqError::Protocol(format!(
                    "MockStore has no scripted reply for {context}"
                )))
            })
    }
}

/// Build an [`Ops`](crate::ops::Ops) surface over a [`MockStore`] with one
/// stub source registered per script name. The stub sources are distinct so
/// each script gets its own SHA.
pub async fn mock_ops(store: &MockStore) -> crate::ops::Ops {
    let sources = crate::scripts::SCRIPT_NAMES
        .iter()
        .map(|name| (*name, format!("-- stub: {name}")))
        .collect::<Vec<_>>();
    let bundle = crate::scripts::ScriptBundle::from_sources(store, sources)
        .await
        .expect("stub sources cover every script name");
    crate::ops::Ops::new(Arc::new(store.clone()), Arc::new(bundle))
}

/// Deterministic stand-in for a script SHA.
pub fn fake_sha(source: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl Store for MockStore {
    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<Value> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(StoreCall::Eval {
                source: source.to_string(),
                keys: keys.to_vec(),
                args: args.to_vec(),
            });
            // EVAL re-populates the server's script cache.
            inner.known_shas.insert(fake_sha(source));
        }
        self.pop_reply("EVAL")
    }

    async fn evalsha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Value> {
        let known = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(StoreCall::EvalSha {
                sha: sha.to_string(),
                keys: keys.to_vec(),
                args: args.to_vec(),
            });
            inner.known_shas.contains(sha)
        };
        if !known {
            return Err(OmniqError::Protocol(
                "NOSCRIPT No matching script. Please use EVAL.".into(),
            ));
        }
        self.pop_reply("EVALSHA")
    }

    async fn script_load(&self, source: &str) -> Result<String> {
        let sha = fake_sha(source);
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(StoreCall::ScriptLoad {
            source: source.to_string(),
        });
        inner.known_shas.insert(sha.clone());
        Ok(sha)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(StoreCall::Exists(key.to_string()));
        Ok(inner.existing_keys.contains(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(StoreCall::HGet(key.to_string(), field.to_string()));
        Ok(inner
            .hash_fields
            .get(&(key.to_string(), field.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_are_consumed_in_order() {
        let store = MockStore::new();
        let sha = store.script_load("return 1").await.unwrap();
        store.push_reply(Value::Int(1));
        store.push_reply(Value::Int(2));

        let first = store.evalsha(&sha, &[], &[]).await.unwrap();
        let second = store.evalsha(&sha, &[], &[]).await.unwrap();
        assert_eq!(first, Value::Int(1));
        assert_eq!(second, Value::Int(2));
    }

    #[tokio::test]
    async fn test_unknown_sha_is_noscript() {
        let store = MockStore::new();
        let err = store.evalsha("deadbeef", &[], &[]).await.unwrap_err();
        assert!(err.is_noscript());
    }

    #[tokio::test]
    async fn test_flush_then_eval_reregisters() {
        let store = MockStore::new();
        let sha = store.script_load("return 1").await.unwrap();
        store.flush_scripts();
        assert!(store.evalsha(&sha, &[], &[]).await.is_err());

        store.push_reply(Value::Okay);
        store.eval("return 1", &[], &[]).await.unwrap();

        store.push_reply(Value::Okay);
        assert!(store.evalsha(&sha, &[], &[]).await.is_ok());
    }
}
