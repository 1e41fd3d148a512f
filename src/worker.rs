//! Consumer runloop: polling, delayed-job promotion, expired-lease reaping,
//! per-job heartbeating, and drain-aware stop handling.
//!
//! One call to [`consume`] drives one cooperative loop. Several consumers in
//! the same process run as independent tasks sharing only the store handle
//! and the script cache. The loop never abandons a running handler; if a
//! handler overruns its lease, the lease expires and `reap_expired` returns
//! the job to the ready lane.

use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ConsumeOptions;
use crate::error::Result;
use crate::exec::ExecContext;
use crate::job::{AckFailOutcome, ReserveOutcome, ReservedJob};
use crate::ops::{derive_heartbeat_interval, paused_backoff, Ops, DEFAULT_JOB_TIMEOUT_MS};

/// Sleep after a reserve transport error or a token-less job reply.
const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// How long to wait for an in-flight heartbeat to settle after stopping.
const HEARTBEAT_SETTLE: Duration = Duration::from_millis(100);

/// Result type for job handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Error returned from job handlers; reported to the server as
/// `"<name>: <message>"`.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Error class name.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error with an explicit class name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a handler error with the generic `Error` class.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::msg(err.to_string())
    }
}

/// Context passed to job handler functions.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Queue the job came from.
    pub queue: String,
    /// Job identifier.
    pub job_id: String,
    /// Original payload JSON text.
    pub payload_raw: String,
    /// Parsed payload; the raw text as a JSON string when parsing fails.
    pub payload: JsonValue,
    /// Attempt counter; 0 on the first lease.
    pub attempt: i64,
    /// Absolute lease expiry in epoch milliseconds.
    pub lock_until_ms: i64,
    /// Lease token for this reservation.
    pub lease_token: String,
    /// Group id; empty when ungrouped.
    pub gid: String,
    /// Queue operations safe to call from inside a handler.
    pub exec: ExecContext,
}

/// Run the consumer loop until a stop is requested via OS signals
/// (per `opts.stop_on_ctrl_c`). See [`ConsumeOptions`] for tunables.
///
/// With `drain` enabled, the first interrupt lets the in-flight job finish
/// and ack before returning; a second interrupt exits the process with
/// status 130. A terminate signal always requests a stop.
pub async fn consume<F, Fut>(
    ops: Arc<Ops>,
    queue: &str,
    handler: F,
    opts: ConsumeOptions,
) -> Result<()>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let signal_task = if opts.stop_on_ctrl_c {
        Some(tokio::spawn(signal_watcher(stop_tx, opts.drain)))
    } else {
        None
    };

    let result = run_loop(&ops, queue, &handler, &opts, stop_rx).await;

    if let Some(task) = signal_task {
        task.abort();
    }
    result
}

/// Like [`consume`], but stopped through an external `watch` channel instead
/// of OS signals; for runtimes that must not install signal handlers.
/// `opts.stop_on_ctrl_c` is ignored.
pub async fn consume_with_shutdown<F, Fut>(
    ops: Arc<Ops>,
    queue: &str,
    handler: F,
    opts: ConsumeOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    run_loop(&ops, queue, &handler, &opts, shutdown).await
}

async fn run_loop<F, Fut>(
    ops: &Arc<Ops>,
    queue: &str,
    handler: &F,
    opts: &ConsumeOptions,
    stop_rx: watch::Receiver<bool>,
) -> Result<()>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    tracing::info!(queue = %queue, "consumer started");

    let mut last_promote: Option<Instant> = None;
    let mut last_reap: Option<Instant> = None;

    loop {
        // The loop is idle between jobs; a pending stop returns here.
        if *stop_rx.borrow() {
            break;
        }

        if cadence_due(&mut last_promote, opts.promote_interval) {
            if let Err(e) = ops.promote_delayed(queue, opts.promote_batch).await {
                if opts.verbose {
                    tracing::warn!(queue = %queue, error = %e, "promote_delayed failed");
                }
            }
        }
        if cadence_due(&mut last_reap, opts.reap_interval) {
            if let Err(e) = ops.reap_expired(queue, opts.reap_batch).await {
                if opts.verbose {
                    tracing::warn!(queue = %queue, error = %e, "reap_expired failed");
                }
            }
        }

        let outcome = match ops.reserve(queue).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if opts.verbose {
                    tracing::warn!(queue = %queue, error = %e, "reserve failed");
                }
                tokio::time::sleep(TRANSPORT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let job = match outcome {
            ReserveOutcome::Empty => {
                tokio::time::sleep(opts.poll_interval).await;
                continue;
            }
            ReserveOutcome::Paused => {
                tokio::time::sleep(paused_backoff(opts.poll_interval)).await;
                continue;
            }
            ReserveOutcome::Job(job) => job,
        };

        if job.lease_token.is_empty() {
            tracing::warn!(queue = %queue, job_id = %job.id, "reserve returned a job without a lease token");
            tokio::time::sleep(TRANSPORT_ERROR_BACKOFF).await;
            continue;
        }

        if *stop_rx.borrow() && !opts.drain {
            // The lease expires on its own and the reaper requeues the job.
            break;
        }

        process_one(ops, queue, handler, opts, job).await;

        if *stop_rx.borrow() && opts.drain {
            break;
        }
    }

    tracing::info!(queue = %queue, "consumer stopped");
    Ok(())
}

async fn process_one<F, Fut>(
    ops: &Arc<Ops>,
    queue: &str,
    handler: &F,
    opts: &ConsumeOptions,
    job: ReservedJob,
) where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    let payload: JsonValue = serde_json::from_str(&job.payload_raw)
        .unwrap_or_else(|_| JsonValue::String(job.payload_raw.clone()));

    let heartbeat_interval = match opts.heartbeat_interval {
        Some(interval) => interval,
        None => {
            let timeout_ms = ops
                .job_timeout_ms(queue, &job.id, DEFAULT_JOB_TIMEOUT_MS)
                .await;
            derive_heartbeat_interval(timeout_ms)
        }
    };

    let ctx = JobContext {
        queue: queue.to_string(),
        job_id: job.id.clone(),
        payload_raw: job.payload_raw.clone(),
        payload,
        attempt: job.attempt,
        lock_until_ms: job.lock_until_ms,
        lease_token: job.lease_token.clone(),
        gid: job.gid.clone(),
        exec: ExecContext::new(ops.clone(), job.id.clone()),
    };

    tracing::debug!(queue = %queue, job_id = %job.id, attempt = job.attempt, "processing job");

    let heartbeater = Heartbeater::spawn(
        ops.clone(),
        queue.to_string(),
        job.id.clone(),
        job.lease_token.clone(),
        heartbeat_interval,
    );

    let result = handler(ctx).await;

    let lost = heartbeater.stop().await;
    if lost {
        // The lease was reaped; acking would race the next reservation.
        tracing::warn!(queue = %queue, job_id = %job.id, "lease lost mid-flight, skipping ack");
        return;
    }

    match result {
        Ok(()) => {
            match ops.ack_success(queue, &job.id, &job.lease_token).await {
                Ok(()) => tracing::debug!(queue = %queue, job_id = %job.id, "job completed"),
                Err(e) => tracing::warn!(queue = %queue, job_id = %job.id, error = %e, "ack_success failed"),
            }
        }
        Err(err) => {
            let message = err.to_string();
            tracing::warn!(queue = %queue, job_id = %job.id, error = %message, "handler failed");
            match ops
                .ack_fail(queue, &job.id, &job.lease_token, Some(&message))
                .await
            {
                Ok(AckFailOutcome::Retry { due_ms }) => {
                    tracing::info!(queue = %queue, job_id = %job.id, due_ms, "job scheduled for retry");
                }
                Ok(AckFailOutcome::Failed) => {
                    tracing::warn!(queue = %queue, job_id = %job.id, "job dead-lettered");
                }
                Err(e) => {
                    tracing::warn!(queue = %queue, job_id = %job.id, error = %e, "ack_fail failed");
                }
            }
        }
    }
}

fn cadence_due(last: &mut Option<Instant>, interval: Duration) -> bool {
    match last {
        Some(at) if at.elapsed() < interval => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeater
// ---------------------------------------------------------------------------

/// Background task that keeps one job's lease alive while its handler runs.
///
/// The first beat happens immediately, then one per interval. A
/// `NOT_ACTIVE`/`TOKEN_MISMATCH` reply marks the lease lost and ends the
/// task; any other failure is retried on the next tick.
pub(crate) struct Heartbeater {
    lost: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeater {
    pub(crate) fn spawn(
        ops: Arc<Ops>,
        queue: String,
        job_id: String,
        lease_token: String,
        interval: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let lost_flag = lost.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Consume the interval's immediate tick so the first beat below
            // runs right away and the next one lands a full interval later.
            ticker.tick().await;

            loop {
                match ops.heartbeat(&queue, &job_id, &lease_token).await {
                    Ok(lock_until_ms) => {
                        tracing::trace!(queue = %queue, job_id = %job_id, lock_until_ms, "lease extended");
                    }
                    Err(e) if e.is_lease_loss() => {
                        lost_flag.store(true, Ordering::SeqCst);
                        tracing::warn!(queue = %queue, job_id = %job_id, error = %e, "lease lost");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(queue = %queue, job_id = %job_id, error = %e, "heartbeat failed, retrying on next tick");
                    }
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => return,
                }
            }
        });

        Self {
            lost,
            stop_tx,
            handle,
        }
    }

    /// Whether the guarded lease has been observed lost.
    pub(crate) fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Cancel the timer, wait up to [`HEARTBEAT_SETTLE`] for an in-flight
    /// beat to finish, and report whether the lease was lost.
    pub(crate) async fn stop(mut self) -> bool {
        let _ = self.stop_tx.send(true);
        let _ = tokio::time::timeout(HEARTBEAT_SETTLE, &mut self.handle).await;
        self.lost()
    }
}

/// A heartbeater must not outlive its job; dropping one (including on an
/// unwinding handler) tears the task down.
impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

async fn signal_watcher(stop: watch::Sender<bool>, drain: bool) {
    let term = terminate_signal();
    tokio::pin!(term);
    let mut term_fired = false;
    let mut interrupts = 0u32;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    return;
                }
                interrupts += 1;
                if drain && interrupts >= 2 {
                    tracing::warn!("second interrupt received, exiting");
                    std::process::exit(130);
                }
                let _ = stop.send(true);
            }
            _ = &mut term, if !term_fired => {
                term_fired = true;
                let _ = stop.send(true);
            }
        }
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await
}
