//! Ethereum JSON-RPC client, the transport under the contract gateway.
//!
//! [`RpcClient`] speaks JSON-RPC over reqwest and plugs into
//! `ethers::providers::Provider` as its [`JsonRpcClient`].
//!
//! ## Resilience
//!
//! * Every method except `eth_sendTransaction` is retried with exponential
//!   back-off on transport errors, HTTP 429 and 5xx, up to `max_retries` times.
//! * `eth_sendTransaction` is sent exactly once. A retry could submit the same
//!   intent twice.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, JsonRpcError, ProviderError, RpcError};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 8_000;

/// EIP-1193 "user rejected request".
pub const USER_REJECTED_CODE: i64 = 4001;

pub const SEND_TRANSACTION: &str = "eth_sendTransaction";

#[derive(Debug, Error)]
pub enum RpcFailure {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(StatusCode),

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RpcFailure {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        })
    }

    fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Transport(_) => true,
            Self::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Rpc(_) | Self::Decode(_) => false,
        }
    }
}

impl RpcError for RpcFailure {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        None
    }
}

impl From<RpcFailure> for ProviderError {
    fn from(failure: RpcFailure) -> Self {
        ProviderError::JsonRpcClientError(Box::new(failure))
    }
}

/// The transport failure inside a provider error, if it came from one.
pub fn transport_failure(err: &ProviderError) -> Option<&RpcFailure> {
    match err {
        ProviderError::JsonRpcClientError(inner) => {
            let inner: &(dyn std::error::Error + 'static) = inner.as_ref();
            inner.downcast_ref::<RpcFailure>()
        }
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    max_retries: u32,
}

impl RpcClient {
    pub fn new(client: Client, url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client,
            url: url.into(),
            max_retries,
        }
    }

    /// One JSON-RPC round trip, no retries.
    async fn round_trip(&self, method: &str, params: &Value) -> Result<Value, RpcFailure> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    RpcFailure::Unreachable(e.to_string())
                } else {
                    RpcFailure::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Status(status));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcFailure::Decode(e.to_string()))?;

        match body.error {
            Some(err) => Err(RpcFailure::Rpc(err)),
            None => Ok(body.result.unwrap_or(Value::Null)),
        }
    }

    /// Like [`RpcClient::round_trip`], retrying transient failures with back-off.
    async fn round_trip_with_retry(&self, method: &str, params: &Value) -> Result<Value, RpcFailure> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 0;

        loop {
            match self.round_trip(method, params).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!("{method} failed (attempt {attempt}, retrying in {backoff}ms): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl JsonRpcClient for RpcClient {
    type Error = RpcFailure;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, RpcFailure>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        let params = serde_json::to_value(params).map_err(|e| RpcFailure::Decode(e.to_string()))?;
        let result = if method == SEND_TRANSACTION {
            self.round_trip(method, &params).await?
        } else {
            self.round_trip_with_retry(method, &params).await?
        };
        serde_json::from_value(result).map_err(|e| RpcFailure::Decode(format!("{method}: {e}")))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
