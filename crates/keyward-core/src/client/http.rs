//! JSON-RPC transport: status mapping and envelope decoding.
//!
//! This is the ONLY place for status code handling. client/mod.rs never
//! interprets status codes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{KeywardError, KeywardResult};

/// Reply to one JSON-RPC call.
#[derive(Debug)]
pub(crate) enum RpcOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// One JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub(crate) struct RpcBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) url: String,
    next_id: Arc<AtomicU64>,
}

impl RpcBackend {
    pub(crate) fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Single call, no retries.
    pub(crate) async fn call(&self, method: &str, params: &Value) -> KeywardResult<RpcOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.url, method, id, "rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| KeywardError::Network {
            message: format!("failed to read response body: {e}"),
        })?;

        // Bundlers report rejections as JSON-RPC errors under 200 or 4xx;
        // a decodable envelope wins over the status line.
        if let Ok(envelope) = serde_json::from_str::<RpcResponse>(&body) {
            if let Some(err) = envelope.error {
                let message = match err.data {
                    Some(data) if !data.is_null() => format!("{} ({data})", err.message),
                    _ => err.message,
                };
                warn!(method, code = err.code, message = %message, "rpc error");
                return Ok(RpcOutcome::Error {
                    code: err.code,
                    message,
                });
            }
            if status.is_success() {
                return Ok(RpcOutcome::Result(envelope.result.unwrap_or(Value::Null)));
            }
        }

        match status.as_u16() {
            200..=299 => Err(KeywardError::InvalidResponse {
                message: format!("{method}: response is not a JSON-RPC envelope"),
            }),

            429 => Err(KeywardError::Network {
                message: format!("{method}: rate limited"),
            }),

            500..=599 => Err(KeywardError::Network {
                message: format!("{method}: server error HTTP {status}"),
            }),

            _ => Err(KeywardError::InvalidResponse {
                message: format!("{method}: unexpected HTTP {status}: {}", truncate(&body)),
            }),
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
