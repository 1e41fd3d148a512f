//! # omniq - Redis-Backed Distributed Job Queue Client
//!
//! A Rust client for a Redis-compatible job queue where every state
//! transition runs as a server-side atomic script: enqueue, lease-based
//! reserve, heartbeat, ack, retry scheduling, dead-letter, pause/resume,
//! and fan-out child counters.
//!
//! ## Features
//!
//! - **Leased processing**: `reserve` hands out jobs under a time-bounded
//!   lease with an opaque token; a per-job heartbeater keeps the lease
//!   alive while the handler runs
//! - **Automatic retries**: failed jobs reschedule with a backoff until
//!   attempts are exhausted, then dead-letter
//! - **Delayed jobs**: publish with a due time; the consumer promotes due
//!   jobs on a fixed cadence
//! - **Crash recovery**: expired leases are reaped back onto the ready lane
//! - **Fan-out coordination**: user-keyed child counters implement fan-in
//!   after a fan-out publish
//! - **Cluster-safe keys**: all keys of one queue share a hash tag, so the
//!   atomic scripts stay legal under cluster mode
//! - **Graceful shutdown**: drain the in-flight job on interrupt, or stop
//!   through an external channel
//!
//! ## Quick Start
//!
//! ### Publishing jobs
//!
//! ```rust,no_run
//! use omniq::{Client, PublishOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> omniq::Result<()> {
//!     let client = Client::connect("redis://localhost").await?;
//!
//!     // Publish for immediate processing
//!     client.publish("emails", &json!({"to": "user@example.com"}), PublishOptions::default()).await?;
//!
//!     // Publish with a delay and a tighter retry budget
//!     let opts = PublishOptions::default()
//!         .max_attempts(2)
//!         .backoff_ms(1_000)
//!         .due_ms(omniq::now_ms() + 60_000);
//!     client.publish("emails", &json!({"to": "later@example.com"}), opts).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Consuming jobs
//!
//! ```rust,no_run
//! use omniq::{Client, ConsumeOptions, JobContext};
//!
//! #[tokio::main]
//! async fn main() -> omniq::Result<()> {
//!     let client = Client::connect("redis://localhost").await?;
//!
//!     client.consume("emails", |ctx: JobContext| async move {
//!         println!("processing {} (attempt {})", ctx.job_id, ctx.attempt);
//!         let to = ctx.payload["to"].as_str().unwrap_or_default();
//!         // send the email...
//!         let _ = to;
//!         Ok(())
//!     }, ConsumeOptions::default()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod job;
pub mod keys;
pub mod ops;
pub mod scripts;
pub mod store;
pub mod testing;
pub mod worker;

// Re-export main types
pub use client::Client;
pub use config::{
    ClientOptions, ClusterNode, ConnectionConfig, ConsumeOptions, CLUSTER_UNSUPPORTED_MARKERS,
    SCRIPTS_DIR_ENV,
};
pub use error::{OmniqError, Result};
pub use exec::ExecContext;
pub use job::{
    now_ms, AckFailOutcome, BatchItemStatus, JobId, Lane, PublishOptions, ReserveOutcome,
    ReservedJob,
};
pub use ops::{
    derive_heartbeat_interval, paused_backoff, Ops, DEFAULT_JOB_TIMEOUT_MS, MAX_BATCH_IDS,
};
pub use scripts::{LoadedScript, ScriptBundle, SCRIPT_NAMES};
pub use store::{RedisStore, SharedStore, Store};
pub use worker::{HandlerError, HandlerResult, JobContext};
