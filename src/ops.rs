//! Typed operation surface over the server-side scripts.
//!
//! Every mutating queue operation is one server-side script invoked through
//! [`Ops::invoke`]: `EVALSHA` on the cached SHA, and on a `NOSCRIPT` reply a
//! single recovery `EVAL` under a process-wide lock. The lock only guards
//! the recovery path; healthy `EVALSHA` traffic never takes it.
//!
//! Replies are ordered sequences whose first element is a discriminant
//! string (`OK`, `EMPTY`, `PAUSED`, `JOB`, `RETRY`, `FAILED`, `ERR`).
//! Anything that does not match its operation's contract surfaces as a
//! [`OmniqError::Protocol`] carrying the raw reply.

use redis::Value;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{OmniqError, Result};
use crate::job::{
    now_ms, AckFailOutcome, BatchItemStatus, JobId, Lane, PublishOptions, ReserveOutcome,
    ReservedJob,
};
use crate::keys::{childs_anchor, job_key, paused_key, queue_anchor};
use crate::scripts::ScriptBundle;
use crate::store::SharedStore;

/// Maximum number of job ids per batch operation.
pub const MAX_BATCH_IDS: usize = 100;

/// Fallback lease duration when a job hash is unreadable.
pub const DEFAULT_JOB_TIMEOUT_MS: i64 = 60_000;

/// At most one recovery `EVAL` in flight per process. Prevents a thundering
/// herd of full-source uploads after a store restart flushes the script
/// cache; shared across every client in the process.
static SCRIPT_RELOAD_LOCK: Mutex<()> = Mutex::const_new(());

/// The typed operation surface. One method per server-side script, plus the
/// two plain-command reads (`is_paused`, `job_timeout_ms`).
pub struct Ops {
    store: SharedStore,
    bundle: Arc<ScriptBundle>,
}

impl Ops {
    /// Build the operation surface over a store and a loaded bundle.
    pub fn new(store: SharedStore, bundle: Arc<ScriptBundle>) -> Self {
        Self { store, bundle }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    async fn invoke(&self, name: &str, anchor: String, args: Vec<String>) -> Result<Value> {
        let script = self
            .bundle
            .get(name)
            .ok_or_else(|| OmniqError::Config(format!("script not loaded: {name}")))?;
        let keys = [anchor];
        match self.store.evalsha(&script.sha, &keys, &args).await {
            Err(e) if e.is_noscript() => {
                let _guard = SCRIPT_RELOAD_LOCK.lock().await;
                self.store.eval(&script.source, &keys, &args).await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Publish a job onto `queue` and return its id.
    ///
    /// The payload must be a JSON object or array; wrap strings and
    /// primitives before publishing. Validation happens before any store
    /// traffic.
    pub async fn publish(
        &self,
        queue: &str,
        payload: &JsonValue,
        opts: PublishOptions,
    ) -> Result<String> {
        if !payload.is_object() && !payload.is_array() {
            return Err(OmniqError::Validation(
                "payload must be a JSON object or array".into(),
            ));
        }
        if opts.max_attempts == 0 {
            return Err(OmniqError::Validation("max_attempts must be >= 1".into()));
        }
        let job_id = opts.job_id.unwrap_or_else(|| JobId::new().to_string());
        let payload_json = serde_json::to_string(payload)?;
        let now = effective_now(opts.now_ms_override);
        let args = vec![
            job_id,
            payload_json,
            opts.max_attempts.to_string(),
            opts.timeout_ms.to_string(),
            opts.backoff_ms.to_string(),
            opts.due_ms.to_string(),
            opts.gid,
            opts.group_limit.to_string(),
            now.to_string(),
        ];
        let reply = self.invoke("enqueue", queue_anchor(queue), args).await?;
        parse_enqueue(reply)
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Reserve the next ready job under a fresh lease.
    pub async fn reserve(&self, queue: &str) -> Result<ReserveOutcome> {
        let args = vec![now_ms().to_string()];
        let reply = self.invoke("reserve", queue_anchor(queue), args).await?;
        parse_reserve(reply)
    }

    /// Extend the lease on a reserved job; returns the new `lock_until_ms`.
    pub async fn heartbeat(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
    ) -> Result<i64> {
        let args = vec![
            job_id.to_string(),
            lease_token.to_string(),
            now_ms().to_string(),
        ];
        let reply = self.invoke("heartbeat", queue_anchor(queue), args).await?;
        parse_heartbeat(reply)
    }

    /// Acknowledge successful completion; the job leaves the queue.
    pub async fn ack_success(&self, queue: &str, job_id: &str, lease_token: &str) -> Result<()> {
        let args = vec![job_id.to_string(), lease_token.to_string()];
        let reply = self.invoke("ack_success", queue_anchor(queue), args).await?;
        parse_ok_or_err("ack_success", reply)
    }

    /// Report a failed attempt. The server either reschedules the job
    /// (delayed lane) or dead-letters it when attempts are exhausted.
    pub async fn ack_fail(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        error: Option<&str>,
    ) -> Result<AckFailOutcome> {
        let mut args = vec![
            job_id.to_string(),
            lease_token.to_string(),
            now_ms().to_string(),
        ];
        if let Some(message) = error {
            args.push(message.to_string());
        }
        let reply = self.invoke("ack_fail", queue_anchor(queue), args).await?;
        parse_ack_fail(reply)
    }

    /// Move due delayed jobs onto the ready lane; returns how many moved.
    pub async fn promote_delayed(&self, queue: &str, batch: usize) -> Result<u64> {
        let args = vec![batch.to_string(), now_ms().to_string()];
        let reply = self
            .invoke("promote_delayed", queue_anchor(queue), args)
            .await?;
        parse_count("promote_delayed", reply)
    }

    /// Return jobs with expired leases to the ready lane; returns how many.
    pub async fn reap_expired(&self, queue: &str, batch: usize) -> Result<u64> {
        let args = vec![batch.to_string(), now_ms().to_string()];
        let reply = self
            .invoke("reap_expired", queue_anchor(queue), args)
            .await?;
        parse_count("reap_expired", reply)
    }

    // -----------------------------------------------------------------------
    // Queue administration
    // -----------------------------------------------------------------------

    /// Pause the queue: `reserve` hands out nothing until `resume`. Running
    /// jobs are unaffected.
    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.invoke("pause", queue_anchor(queue), Vec::new()).await?;
        Ok(())
    }

    /// Resume a paused queue.
    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.invoke("resume", queue_anchor(queue), Vec::new()).await?;
        Ok(())
    }

    /// Whether the queue is currently paused.
    pub async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.store.exists(&paused_key(queue)).await
    }

    /// Move one dead-lettered job back to the ready lane.
    pub async fn retry_failed(&self, queue: &str, job_id: &str) -> Result<()> {
        let args = vec![job_id.to_string()];
        let reply = self
            .invoke("retry_failed", queue_anchor(queue), args)
            .await?;
        parse_ok_or_err("retry_failed", reply)
    }

    /// Move up to [`MAX_BATCH_IDS`] dead-lettered jobs back to ready,
    /// reporting per-job status.
    pub async fn retry_failed_batch(
        &self,
        queue: &str,
        job_ids: &[String],
    ) -> Result<Vec<BatchItemStatus>> {
        check_batch_size(job_ids)?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .invoke("retry_failed_batch", queue_anchor(queue), job_ids.to_vec())
            .await?;
        parse_batch("retry_failed_batch", reply)
    }

    /// Delete one job from the given lane.
    pub async fn remove_job(&self, queue: &str, lane: Lane, job_id: &str) -> Result<()> {
        let args = vec![lane.as_str().to_string(), job_id.to_string()];
        let reply = self.invoke("remove_job", queue_anchor(queue), args).await?;
        parse_ok_or_err("remove_job", reply)
    }

    /// Delete up to [`MAX_BATCH_IDS`] jobs from the given lane, reporting
    /// per-job status.
    pub async fn remove_jobs_batch(
        &self,
        queue: &str,
        lane: Lane,
        job_ids: &[String],
    ) -> Result<Vec<BatchItemStatus>> {
        check_batch_size(job_ids)?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = Vec::with_capacity(job_ids.len() + 1);
        args.push(lane.as_str().to_string());
        args.extend(job_ids.iter().cloned());
        let reply = self
            .invoke("remove_jobs_batch", queue_anchor(queue), args)
            .await?;
        parse_batch("remove_jobs_batch", reply)
    }

    // -----------------------------------------------------------------------
    // Fan-out child counters
    // -----------------------------------------------------------------------

    /// Initialize a child counter to the expected number of children.
    pub async fn childs_init(&self, key: &str, expected: u64) -> Result<()> {
        let anchor = childs_anchor(key)?;
        let reply = self
            .invoke("childs_init", anchor, vec![expected.to_string()])
            .await?;
        parse_ok_or_err("childs_init", reply)
    }

    /// Decrement a child counter; returns the remaining count.
    ///
    /// Returns -1 once the counter already hit zero, and -1 on any store
    /// anomaly as well, so retried handlers observe one stable sentinel.
    pub async fn child_ack(&self, key: &str, child_id: &str) -> Result<i64> {
        let anchor = childs_anchor(key)?;
        match self
            .invoke("child_ack", anchor, vec![child_id.to_string()])
            .await
        {
            Ok(reply) => Ok(parse_child_ack(reply)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "child_ack swallowed store error");
                Ok(-1)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived reads
    // -----------------------------------------------------------------------

    /// Read a job's lease duration from its record, falling back to
    /// `default` when the field is absent, non-positive, or unreadable.
    pub async fn job_timeout_ms(&self, queue: &str, job_id: &str, default: i64) -> i64 {
        match self.store.hget(&job_key(queue, job_id), "timeout_ms").await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(ms) if ms > 0 => ms,
                _ => default,
            },
            Ok(None) => default,
            Err(e) => {
                tracing::debug!(queue = %queue, job_id = %job_id, error = %e, "timeout_ms read failed");
                default
            }
        }
    }
}

/// Backoff before re-polling a paused queue: ten poll intervals, floored at
/// 250 ms.
pub fn paused_backoff(poll_interval: Duration) -> Duration {
    Duration::from_secs_f64((poll_interval.as_secs_f64() * 10.0).max(0.25))
}

/// Heartbeat cadence derived from the lease duration: half the lease in
/// seconds, clamped to [1 s, 10 s].
pub fn derive_heartbeat_interval(timeout_ms: i64) -> Duration {
    Duration::from_secs_f64((timeout_ms as f64 / 2000.0).clamp(1.0, 10.0))
}

fn effective_now(now_ms_override: i64) -> i64 {
    if now_ms_override != 0 {
        now_ms_override
    } else {
        now_ms()
    }
}

fn check_batch_size(job_ids: &[String]) -> Result<()> {
    if job_ids.len() > MAX_BATCH_IDS {
        return Err(OmniqError::Validation(format!(
            "batch holds {} ids, limit is {MAX_BATCH_IDS}",
            job_ids.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

fn reply_items(op: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(OmniqError::Protocol(format!(
            "{op} returned unexpected reply: {other:?}"
        ))),
    }
}

fn item_str(value: &Value) -> Option<String> {
    match value {
        Value::SimpleString(s) => Some(s.clone()),
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Okay => Some("OK".to_string()),
        _ => None,
    }
}

fn item_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

fn protocol(op: &str, reply: &[Value]) -> OmniqError {
    OmniqError::Protocol(format!("{op} returned unexpected reply: {reply:?}"))
}

fn script_err(op: &str, items: &[Value]) -> OmniqError {
    let reason = items
        .get(1)
        .and_then(item_str)
        .unwrap_or_else(|| "unknown".to_string());
    OmniqError::script(op, reason)
}

fn parse_enqueue(reply: Value) -> Result<String> {
    let items = reply_items("enqueue", reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("OK") => items
            .get(1)
            .and_then(item_str)
            .ok_or_else(|| protocol("enqueue", &items)),
        _ => Err(protocol("enqueue", &items)),
    }
}

fn parse_reserve(reply: Value) -> Result<ReserveOutcome> {
    let items = reply_items("reserve", reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("EMPTY") => Ok(ReserveOutcome::Empty),
        Some("PAUSED") => Ok(ReserveOutcome::Paused),
        Some("JOB") if items.len() >= 7 => {
            let job = ReservedJob {
                id: item_str(&items[1]).ok_or_else(|| protocol("reserve", &items))?,
                payload_raw: item_str(&items[2]).ok_or_else(|| protocol("reserve", &items))?,
                lock_until_ms: item_i64(&items[3]).ok_or_else(|| protocol("reserve", &items))?,
                attempt: item_i64(&items[4]).ok_or_else(|| protocol("reserve", &items))?,
                gid: item_str(&items[5]).unwrap_or_default(),
                lease_token: item_str(&items[6]).ok_or_else(|| protocol("reserve", &items))?,
            };
            Ok(ReserveOutcome::Job(job))
        }
        _ => Err(protocol("reserve", &items)),
    }
}

fn parse_heartbeat(reply: Value) -> Result<i64> {
    let items = reply_items("heartbeat", reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("OK") => items
            .get(1)
            .and_then(item_i64)
            .ok_or_else(|| protocol("heartbeat", &items)),
        Some("ERR") => Err(script_err("heartbeat", &items)),
        _ => Err(protocol("heartbeat", &items)),
    }
}

fn parse_ok_or_err(op: &str, reply: Value) -> Result<()> {
    let items = reply_items(op, reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("OK") => Ok(()),
        Some("ERR") => Err(script_err(op, &items)),
        _ => Err(protocol(op, &items)),
    }
}

fn parse_ack_fail(reply: Value) -> Result<AckFailOutcome> {
    let items = reply_items("ack_fail", reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("RETRY") => {
            let due_ms = items
                .get(1)
                .and_then(item_i64)
                .ok_or_else(|| protocol("ack_fail", &items))?;
            Ok(AckFailOutcome::Retry { due_ms })
        }
        Some("FAILED") => Ok(AckFailOutcome::Failed),
        Some("ERR") => Err(script_err("ack_fail", &items)),
        _ => Err(protocol("ack_fail", &items)),
    }
}

fn parse_count(op: &str, reply: Value) -> Result<u64> {
    let items = reply_items(op, reply)?;
    match items.first().and_then(item_str).as_deref() {
        Some("OK") => items
            .get(1)
            .and_then(item_i64)
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| protocol(op, &items)),
        _ => Err(protocol(op, &items)),
    }
}

fn parse_batch(op: &str, reply: Value) -> Result<Vec<BatchItemStatus>> {
    let items = reply_items(op, reply)?;
    if items.first().and_then(item_str).as_deref() == Some("ERR") {
        return Err(script_err(op, &items));
    }
    if items.len() % 3 != 0 {
        return Err(protocol(op, &items));
    }
    let mut statuses = Vec::with_capacity(items.len() / 3);
    for triple in items.chunks_exact(3) {
        let job_id = item_str(&triple[0]).ok_or_else(|| protocol(op, &items))?;
        let status = item_str(&triple[1]).ok_or_else(|| protocol(op, &items))?;
        statuses.push(BatchItemStatus {
            job_id,
            ok: status == "OK",
            reason: item_str(&triple[2]),
        });
    }
    Ok(statuses)
}

fn parse_child_ack(reply: Value) -> i64 {
    let Ok(items) = reply_items("child_ack", reply) else {
        return -1;
    };
    if items.first().and_then(item_str).as_deref() != Some("OK") {
        return -1;
    }
    items.get(1).and_then(item_i64).unwrap_or(-1)
}
