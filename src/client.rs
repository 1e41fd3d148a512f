//! Client facade: store connection, script bundle, and the operation
//! surface behind one handle.

use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ClientOptions, ConsumeOptions};
use crate::error::Result;
use crate::job::{
    AckFailOutcome, BatchItemStatus, Lane, PublishOptions, ReserveOutcome,
};
use crate::ops::Ops;
use crate::scripts::{resolve_scripts_dir, ScriptBundle};
use crate::store::{RedisStore, SharedStore};
use crate::worker::{self, HandlerResult, JobContext};

/// A connected queue client.
///
/// # Example
///
/// ```rust,no_run
/// use omniq::{Client, PublishOptions};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> omniq::Result<()> {
///     let client = Client::connect("redis://localhost").await?;
///     let job_id = client
///         .publish("emails", &json!({"to": "user@example.com"}), PublishOptions::default())
///         .await?;
///     println!("published {job_id}");
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    ops: Arc<Ops>,
}

impl Client {
    /// Connect per the given options, resolve the scripts directory, and
    /// pre-register the script bundle. Missing scripts fail here, not at
    /// first use.
    pub async fn create(opts: ClientOptions) -> Result<Self> {
        let store: SharedStore = Arc::new(RedisStore::connect(&opts.connection).await?);
        let dir = match opts.scripts_dir {
            Some(dir) => dir,
            None => resolve_scripts_dir()?,
        };
        let bundle = ScriptBundle::load(store.as_ref(), &dir).await?;
        Ok(Self {
            ops: Arc::new(Ops::new(store, Arc::new(bundle))),
        })
    }

    /// Connect with a plain URL and default options.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::create(ClientOptions::url(url)).await
    }

    /// Build a client over an already-connected store and a loaded bundle.
    /// Useful for custom transports and tests.
    pub fn with_store(store: SharedStore, bundle: Arc<ScriptBundle>) -> Self {
        Self {
            ops: Arc::new(Ops::new(store, bundle)),
        }
    }

    /// The typed operation surface.
    pub fn ops(&self) -> &Arc<Ops> {
        &self.ops
    }

    /// Close the client. The store connection drops with the last handle.
    pub async fn close(self) -> Result<()> {
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operation pass-throughs
    // -----------------------------------------------------------------------

    /// Publish a job. See [`Ops::publish`].
    pub async fn publish(
        &self,
        queue: &str,
        payload: &JsonValue,
        opts: PublishOptions,
    ) -> Result<String> {
        self.ops.publish(queue, payload, opts).await
    }

    /// Reserve the next ready job. See [`Ops::reserve`].
    pub async fn reserve(&self, queue: &str) -> Result<ReserveOutcome> {
        self.ops.reserve(queue).await
    }

    /// Extend a lease. See [`Ops::heartbeat`].
    pub async fn heartbeat(&self, queue: &str, job_id: &str, lease_token: &str) -> Result<i64> {
        self.ops.heartbeat(queue, job_id, lease_token).await
    }

    /// Acknowledge success. See [`Ops::ack_success`].
    pub async fn ack_success(&self, queue: &str, job_id: &str, lease_token: &str) -> Result<()> {
        self.ops.ack_success(queue, job_id, lease_token).await
    }

    /// Report a failed attempt. See [`Ops::ack_fail`].
    pub async fn ack_fail(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        error: Option<&str>,
    ) -> Result<AckFailOutcome> {
        self.ops.ack_fail(queue, job_id, lease_token, error).await
    }

    /// Promote due delayed jobs. See [`Ops::promote_delayed`].
    pub async fn promote_delayed(&self, queue: &str, batch: usize) -> Result<u64> {
        self.ops.promote_delayed(queue, batch).await
    }

    /// Requeue expired leases. See [`Ops::reap_expired`].
    pub async fn reap_expired(&self, queue: &str, batch: usize) -> Result<u64> {
        self.ops.reap_expired(queue, batch).await
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

    /// Restore one dead-lettered job. See [`Ops::retry_failed`].
    pub async fn retry_failed(&self, queue: &str, job_id: &str) -> Result<()> {
        self.ops.retry_failed(queue, job_id).await
    }

    /// Restore dead-lettered jobs in bulk. See [`Ops::retry_failed_batch`].
    pub async fn retry_failed_batch(
        &self,
        queue: &str,
        job_ids: &[String],
    ) -> Result<Vec<BatchItemStatus>> {
        self.ops.retry_failed_batch(queue, job_ids).await
    }

    /// Delete one job from a lane. See [`Ops::remove_job`].
    pub async fn remove_job(&self, queue: &str, lane: Lane, job_id: &str) -> Result<()> {
        self.ops.remove_job(queue, lane, job_id).await
    }

    /// Delete jobs from a lane in bulk. See [`Ops::remove_jobs_batch`].
    pub async fn remove_jobs_batch(
        &self,
        queue: &str,
        lane: Lane,
        job_ids: &[String],
    ) -> Result<Vec<BatchItemStatus>> {
        self.ops.remove_jobs_batch(queue, lane, job_ids).await
    }

    /// Initialize a fan-out child counter. See [`Ops::childs_init`].
    pub async fn childs_init(&self, key: &str, expected: u64) -> Result<()> {
        self.ops.childs_init(key, expected).await
    }

    /// Decrement a child counter. See [`Ops::child_ack`].
    pub async fn child_ack(&self, key: &str, child_id: &str) -> Result<i64> {
        self.ops.child_ack(key, child_id).await
    }

    // -----------------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------------

    /// Run a consumer loop on `queue` until stopped. See
    /// [`worker::consume`] for the stop and drain semantics.
    pub async fn consume<F, Fut>(
        &self,
        queue: &str,
        handler: F,
        opts: ConsumeOptions,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        worker::consume(self.ops.clone(), queue, handler, opts).await
    }

    /// Run a consumer loop stopped through an external channel instead of
    /// OS signals. See [`worker::consume_with_shutdown`].
    pub async fn consume_with_shutdown<F, Fut>(
        &self,
        queue: &str,
        handler: F,
        opts: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        worker::consume_with_shutdown(self.ops.clone(), queue, handler, opts, shutdown).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}
