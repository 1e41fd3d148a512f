//! Store abstraction and the Redis implementation.
//!
//! The client needs only five primitives from the backing store: `EVAL`,
//! `EVALSHA`, `SCRIPT LOAD`, `EXISTS`, and `HGET`. The [`Store`] trait
//! captures them so the operations layer can be exercised against a mock
//! (see [`crate::testing`]) and so standalone and cluster connections share
//! one call path.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectionConfig, CLUSTER_UNSUPPORTED_MARKERS};
use crate::error::{OmniqError, Result};

/// Store trait covering the command subset the client uses.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a script from source with the declared keys and arguments.
    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<Value>;

    /// Run a cached script by SHA with the declared keys and arguments.
    async fn evalsha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Value>;

    /// Register a script with the store's script cache; returns the SHA.
    async fn script_load(&self, source: &str) -> Result<String>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read a single hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
}

/// A cloneable, type-erased store handle.
pub type SharedStore = Arc<dyn Store>;

/// Redis-backed store, standalone or cluster.
#[derive(Clone)]
pub enum RedisStore {
    /// Single-node connection via the reconnecting manager.
    Standalone(ConnectionManager),
    /// Cluster-routed connection.
    Cluster(ClusterConnection),
}

impl RedisStore {
    /// Open a connection per the given configuration.
    ///
    /// In cluster mode, a server that rejects cluster commands (message
    /// matched against [`CLUSTER_UNSUPPORTED_MARKERS`]) downgrades the
    /// connection to standalone against the first node.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        match config {
            ConnectionConfig::Cluster { nodes } => {
                if nodes.is_empty() {
                    return Err(OmniqError::Config(
                        "cluster connection requires at least one node".into(),
                    ));
                }
                let urls: Vec<String> = nodes.iter().map(|n| n.url()).collect();
                match Self::connect_cluster(urls).await {
                    Ok(store) => Ok(store),
                    Err(e) if is_cluster_unsupported(&e) => {
                        tracing::warn!(
                            error = %e,
                            "server rejects cluster commands, falling back to standalone"
                        );
                        Self::connect_standalone(&nodes[0].url(), None, None).await
                    }
                    Err(e) => Err(e),
                }
            }
            ConnectionConfig::Params {
                socket_timeout_ms,
                socket_connect_timeout_ms,
                ..
            } => {
                let url = config.to_url().ok_or_else(|| {
                    OmniqError::Config("connection parameters do not form a URL".into())
                })?;
                Self::connect_standalone(&url, *socket_timeout_ms, *socket_connect_timeout_ms)
                    .await
            }
            ConnectionConfig::Url(url) => Self::connect_standalone(url, None, None).await,
        }
    }

    async fn connect_standalone(
        url: &str,
        socket_timeout_ms: Option<u64>,
        socket_connect_timeout_ms: Option<u64>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut manager_config = ConnectionManagerConfig::new();
        if let Some(ms) = socket_timeout_ms {
            manager_config = manager_config.set_response_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = socket_connect_timeout_ms {
            manager_config = manager_config.set_connection_timeout(Duration::from_millis(ms));
        }
        let conn = ConnectionManager::new_with_config(client, manager_config).await?;
        Ok(Self::Standalone(conn))
    }

    async fn connect_cluster(urls: Vec<String>) -> Result<Self> {
        let client = ClusterClient::new(urls)?;
        let conn = client.get_async_connection().await?;
        Ok(Self::Cluster(conn))
    }

    async fn query(&self, cmd: redis::Cmd) -> Result<Value> {
        match self {
            Self::Standalone(conn) => {
                let mut conn = conn.clone();
                Ok(cmd.query_async(&mut conn).await?)
            }
            Self::Cluster(conn) => {
                let mut conn = conn.clone();
                Ok(cmd.query_async(&mut conn).await?)
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<Value> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(source).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        self.query(cmd).await
    }

    async fn evalsha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Value> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        self.query(cmd).await
    }

    async fn script_load(&self, source: &str) -> Result<String> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(source);
        match self.query(cmd).await? {
            Value::BulkString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Value::SimpleString(s) => Ok(s),
            other => Err(OmniqError::Protocol(format!(
                "SCRIPT LOAD returned {other:?}"
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        match self.query(cmd).await? {
            Value::Int(n) => Ok(n > 0),
            other => Err(OmniqError::Protocol(format!("EXISTS returned {other:?}"))),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        match self.query(cmd).await? {
            Value::Nil => Ok(None),
            Value::BulkString(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Value::SimpleString(s) => Ok(Some(s)),
            other => Err(OmniqError::Protocol(format!("HGET returned {other:?}"))),
        }
    }
}

fn is_cluster_unsupported(err: &OmniqError) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    CLUSTER_UNSUPPORTED_MARKERS
        .iter()
        .any(|marker| msg.contains(marker))
}
