/// RPC Client Module
///
/// This module handles all interactions with the ledger node via JSON-RPC over HTTP.
/// The `LedgerApi` trait is the seam the pipeline depends on; `SteemRpcClient` is the
/// network implementation.
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{ConfigError, DecodeError, FetchError, TransportError};
use crate::models::BlockHeight;

/// Remote node operations the harvester consumes. Results are returned as raw JSON and decoded
/// by the transform stage. A body that is not JSON at all is already a `FetchError::Decode`.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn get_dynamic_global_properties(&self) -> Result<Value, FetchError>;

    async fn get_block(&self, height: BlockHeight) -> Result<Value, FetchError>;

    /// History page ending at `from` (`-1` for the latest entry), at most `limit` entries
    async fn get_account_history(&self, account: &str, from: i64, limit: u32) -> Result<Value, FetchError>;

    async fn get_account_votes(&self, account: &str) -> Result<Value, FetchError>;

    async fn get_accounts(&self, names: &[String]) -> Result<Value, FetchError>;
}

pub struct SteemRpcClient {
    client: RwLock<reqwest::Client>,
    endpoint: String,
    reconnect: bool,
    timeout: Duration,
    next_id: AtomicU64,
    /// Bumped every time the connection pool is rebuilt
    generation: AtomicU64,
}

impl SteemRpcClient {
    /// Create a new RPC client for the specified endpoint
    pub fn new(endpoint: String, reconnect: bool, timeout: Duration) -> Result<Self, ConfigError> {
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint { url: endpoint.clone(), reason: e.to_string() })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                url: endpoint,
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }

        let client = build_http_client(timeout)
            .map_err(|e| ConfigError::InvalidEndpoint { url: endpoint.clone(), reason: e.to_string() })?;

        Ok(Self { client: RwLock::new(client), endpoint, reconnect, timeout, next_id: AtomicU64::new(1), generation: AtomicU64::new(0) })
    }

    /// Get the endpoint URL this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// How many times the connection pool has been rebuilt
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn http(&self) -> reqwest::Client {
        self.client.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Drop the pooled connections so the next call dials the node again
    fn reset_connection(&self) {
        match build_http_client(self.timeout) {
            Ok(fresh) => {
                *self.client.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(endpoint = %self.endpoint, generation, "Reconnecting to ledger node");
            }
            Err(e) => tracing::warn!(endpoint = %self.endpoint, "Could not rebuild HTTP client: {}", e),
        }
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        tracing::debug!(method, id, "Calling ledger node");

        let result = self.send(method, &request).await;
        if let Err(FetchError::Transport(e)) = &result {
            if self.reconnect && e.is_connection_failure() {
                self.reset_connection();
            }
        }
        result
    }

    async fn send(&self, method: &'static str, request: &Value) -> Result<Value, FetchError> {
        let http_err = |source: reqwest::Error| TransportError::Http { method, source };

        let response = self
            .http()
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;

        // Read the bytes first so a garbled body is told apart from a broken connection
        let bytes = response.bytes().await.map_err(http_err)?;
        let mut body: Map<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::Structural(format!("`{}` response is not a JSON-RPC object: {}", method, e)))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(TransportError::Rpc {
                method,
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or_default(),
                message: error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error").to_string(),
            }
            .into());
        }

        // A present-but-null result is meaningful (e.g. a block that does not exist yet)
        Ok(body.remove("result").ok_or(TransportError::EmptyResponse { method })?)
    }
}

fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
}

#[async_trait]
impl LedgerApi for SteemRpcClient {
    async fn get_dynamic_global_properties(&self) -> Result<Value, FetchError> {
        self.call("condenser_api.get_dynamic_global_properties", json!([])).await
    }

    async fn get_block(&self, height: BlockHeight) -> Result<Value, FetchError> {
        self.call("condenser_api.get_block", json!([height])).await
    }

    async fn get_account_history(&self, account: &str, from: i64, limit: u32) -> Result<Value, FetchError> {
        self.call("condenser_api.get_account_history", json!([account, from, limit])).await
    }

    async fn get_account_votes(&self, account: &str) -> Result<Value, FetchError> {
        self.call("condenser_api.get_account_votes", json!([account])).await
    }

    async fn get_accounts(&self, names: &[String]) -> Result<Value, FetchError> {
        self.call("condenser_api.get_accounts", json!([names])).await
    }
}
