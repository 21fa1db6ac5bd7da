//! Relayer contract and the JSON-RPC bundler client.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::time::Duration;

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::abi::{self, Token};
use crate::config::KeywardConfig;
use crate::digest::selector;
use crate::error::{KeywardError, KeywardResult};
use crate::operation::{MockSignedOperation, SignedOperation};
use crate::types::{FeeParams, GasEstimate, OperationReceipt, SmartAccount};

mod helpers;
mod http;

use http::{RpcBackend, RpcOutcome};

const USER_AGENT_VALUE: &str = concat!("keyward/", env!("CARGO_PKG_VERSION"));

/// Fee estimation, broadcast and receipt lookup.
///
/// Implementations must not retry on their own: a resubmission under an
/// ambiguous nonce can authorize the same operation twice.
#[async_trait]
pub trait Relayer: Send + Sync {
    /// Full nonce (`key << 64 | sequence`) for `key` on `account`.
    async fn nonce(&self, account: &SmartAccount, key: U256) -> KeywardResult<U256>;

    /// Current fee parameters.
    async fn fee_params(&self) -> KeywardResult<FeeParams>;

    /// Gas limits for a placeholder-signed operation.
    async fn estimate(&self, op: &MockSignedOperation) -> KeywardResult<GasEstimate>;

    /// Broadcast a signed operation; returns the operation hash.
    async fn submit(&self, op: &SignedOperation) -> KeywardResult<B256>;

    /// Terminal receipt, or `None` while pending.
    async fn receipt(&self, op_hash: B256) -> KeywardResult<Option<OperationReceipt>>;
}

/// Bundler client speaking the ERC-4337 JSON-RPC dialect.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    bundler: RpcBackend,
    chain: RpcBackend,
    sponsored: bool,
}

impl BundlerClient {
    /// Client for `bundler_url` (operations) and `rpc_url` (nonce reads).
    pub fn new(bundler_url: &str, rpc_url: &str, timeout: Duration) -> KeywardResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| KeywardError::Network {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            bundler: RpcBackend::new(client.clone(), bundler_url.trim_end_matches('/')),
            chain: RpcBackend::new(client, rpc_url.trim_end_matches('/')),
            sponsored: false,
        })
    }

    pub fn from_config(config: &KeywardConfig) -> KeywardResult<Self> {
        let bundler_url = config
            .bundler_url
            .as_deref()
            .ok_or_else(|| KeywardError::Config {
                message: "no bundler URL configured (KEYWARD_BUNDLER_URL)".to_string(),
            })?;
        Ok(Self::new(bundler_url, &config.rpc_url, Duration::from_secs(30))?
            .with_sponsorship(config.allow_paymaster))
    }

    /// Estimate through `pm_sponsorUserOperation` so a paymaster covers gas.
    pub fn with_sponsorship(mut self, sponsored: bool) -> Self {
        self.sponsored = sponsored;
        self
    }

    async fn call(&self, backend: &RpcBackend, method: &str, params: Value) -> KeywardResult<Value> {
        match backend.call(method, &params).await? {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error { code, message } => Err(match method {
                "eth_sendUserOperation" | "eth_estimateUserOperationGas"
                | "pm_sponsorUserOperation" => KeywardError::RelayerRejected { message },
                _ => KeywardError::InvalidResponse {
                    message: format!("{method} failed ({code}): {message}"),
                },
            }),
        }
    }
}

#[async_trait]
impl Relayer for BundlerClient {
    async fn nonce(&self, account: &SmartAccount, key: U256) -> KeywardResult<U256> {
        let data = abi::encode_call(
            selector("getNonce(address,uint192)"),
            &[Token::Address(account.address), Token::Uint(key)],
        );
        let params = json!([
            { "to": account.entry_point, "data": format!("0x{}", hex::encode(data)) },
            "latest"
        ]);
        let result = self.call(&self.chain, "eth_call", params).await?;
        let nonce = helpers::parse_u256(&result, "getNonce")?;
        debug!(account = %account.address, nonce = %nonce, "fetched nonce");
        Ok(nonce)
    }

    async fn fee_params(&self) -> KeywardResult<FeeParams> {
        let result = self
            .call(&self.bundler, "pimlico_getUserOperationGasPrice", json!([]))
            .await?;
        helpers::parse_fee_params(&result)
    }

    async fn estimate(&self, op: &MockSignedOperation) -> KeywardResult<GasEstimate> {
        let method = if self.sponsored {
            "pm_sponsorUserOperation"
        } else {
            "eth_estimateUserOperationGas"
        };
        let params = json!([op.operation().to_rpc_json(), op.entry_point()]);
        let result = self.call(&self.bundler, method, params).await?;
        helpers::parse_gas_estimate(&result)
    }

    async fn submit(&self, op: &SignedOperation) -> KeywardResult<B256> {
        let params = json!([op.operation().to_rpc_json(), op.entry_point()]);
        let result = self
            .call(&self.bundler, "eth_sendUserOperation", params)
            .await?;
        let op_hash = helpers::parse_hash(&result, "userOpHash")?;
        info!(op_hash = %op_hash, "operation submitted");
        Ok(op_hash)
    }

    async fn receipt(&self, op_hash: B256) -> KeywardResult<Option<OperationReceipt>> {
        let result = self
            .call(&self.bundler, "eth_getUserOperationReceipt", json!([op_hash]))
            .await?;
        helpers::parse_receipt(&result)
    }
}
