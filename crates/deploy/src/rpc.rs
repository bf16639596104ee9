//! Ethereum JSON-RPC access used by the submission sequencer.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U64, U128, keccak256};
use alloy_core::sol_types::{ContractError, GenericRevertReason, RevertReason};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::signer::SignedTransaction;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure reported by a node or by the transport in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("execution reverted: {reason}")]
    Reverted { reason: String, data: Option<Bytes> },

    #[error("nonce too low")]
    NonceTooLow,

    #[error("transaction already known")]
    AlreadyKnown,

    #[error("replacement transaction underpriced")]
    Underpriced,

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl ChainError {
    /// Failures worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }

    /// Classify a JSON-RPC error object.
    pub fn from_rpc(code: i64, message: &str, data: Option<&Value>) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("nonce too low") {
            return ChainError::NonceTooLow;
        }
        if lower.contains("already known") || lower.contains("known transaction") {
            return ChainError::AlreadyKnown;
        }
        if lower.contains("underpriced") {
            return ChainError::Underpriced;
        }
        if code == 3 || lower.contains("revert") {
            let data = data
                .and_then(Value::as_str)
                .and_then(|hex| Bytes::from_str(hex).ok());
            let reason = data
                .as_ref()
                .and_then(|bytes| revert_reason(bytes))
                .unwrap_or_else(|| message.to_string());
            return ChainError::Reverted { reason, data };
        }
        if code == -32005
            || lower.contains("rate limit")
            || lower.contains("timeout")
            || lower.contains("header not found")
        {
            return ChainError::Transport(message.to_string());
        }

        ChainError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

/// Decode revert data into the bare reason string, without the `revert: ` prefix
/// `Display` adds to `Error(string)` payloads.
fn revert_reason(data: &[u8]) -> Option<String> {
    match GenericRevertReason::decode(data)? {
        RevertReason::ContractError(ContractError::Revert(revert)) => Some(revert.reason),
        other => Some(other.to_string()),
    }
}

/// How a revert should be interpreted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RevertKind {
    /// The single-initialization guard fired: the call already took effect.
    AlreadyInitialized,
    /// The deploying identity lacks the privilege the target expects.
    Unauthorized,
    Other,
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Classify a revert from its decoded reason and raw data.
pub fn classify_revert(reason: &str, data: Option<&Bytes>) -> RevertKind {
    if let Some(prefix) = data.and_then(|d| d.get(..4)) {
        if prefix == selector("InvalidInitialization()") {
            return RevertKind::AlreadyInitialized;
        }
        if prefix == selector("OwnableUnauthorizedAccount(address)")
            || prefix == selector("AccessControlUnauthorizedAccount(address,bytes32)")
        {
            return RevertKind::Unauthorized;
        }
    }

    let lower = reason.to_lowercase();
    if lower.contains("already initialized") {
        RevertKind::AlreadyInitialized
    } else if lower.contains("caller is not the owner")
        || lower.contains("accesscontrol:")
        || lower.contains("unauthorized")
        || lower.contains("not authorized")
    {
        RevertKind::Unauthorized
    } else {
        RevertKind::Other
    }
}

/// Read-only call or gas estimation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRequest {
    pub from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    pub data: Bytes,
}

/// The parts of a transaction receipt the orchestrator relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    status: Option<U64>,
    contract_address: Option<Address>,
    block_number: Option<U64>,
}

impl From<RawReceipt> for Receipt {
    fn from(raw: RawReceipt) -> Self {
        Self {
            transaction_hash: raw.transaction_hash,
            // Pre-Byzantium receipts carry no status; treat them as successful.
            success: raw.status.is_none_or(|status| status == U64::from(1)),
            contract_address: raw.contract_address,
            block_number: raw.block_number.map(|n| n.to::<u64>()),
        }
    }
}

/// Minimal chain access needed to deploy and wire units.
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Next usable nonce for `address`, including pending transactions.
    fn transaction_count(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, ChainError>> + Send;

    fn estimate_gas(
        &self,
        call: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn call(&self, call: &CallRequest) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    fn send_transaction(
        &self,
        tx: &SignedTransaction,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Receipt>, ChainError>> + Send;

    fn code_at(&self, address: Address) -> impl Future<Output = Result<Bytes, ChainError>> + Send;
}

/// JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRpc {
    client: reqwest::Client,
    url: Url,
}

impl HttpRpc {
    pub fn new(url: Url) -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, url })
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| ChainError::Transport(format!("failed to send {method} request: {e}")))?;

        if response.status().is_server_error() {
            return Err(ChainError::Transport(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Transport(format!("failed to parse {method} response: {e}")))?;

        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::debug!(method, code, message, "RPC returned an error");
            return Err(ChainError::from_rpc(code, message, error.get("data")));
        }

        let result = body.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| ChainError::Rpc {
            code: 0,
            message: format!("failed to deserialize {method} result: {e}"),
        })
    }
}

impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        let id: U64 = self.request("eth_chainId", serde_json::json!([])).await?;
        Ok(id.to::<u64>())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let count: U64 = self
            .request(
                "eth_getTransactionCount",
                serde_json::json!([address, "pending"]),
            )
            .await?;
        Ok(count.to::<u64>())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let price: U128 = self.request("eth_gasPrice", serde_json::json!([])).await?;
        Ok(price.to::<u128>())
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        let gas: U64 = self
            .request("eth_estimateGas", serde_json::json!([call]))
            .await?;
        Ok(gas.to::<u64>())
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, ChainError> {
        self.request("eth_call", serde_json::json!([call, "latest"]))
            .await
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<B256, ChainError> {
        self.request("eth_sendRawTransaction", serde_json::json!([tx.raw]))
            .await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, ChainError> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await?;
        Ok(raw.map(Receipt::from))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.request("eth_getCode", serde_json::json!([address, "latest"]))
            .await
    }
}
