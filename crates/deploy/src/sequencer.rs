//! Serialized transaction submission for a single deploying identity.
//!
//! The sequencer is the only component that signs and broadcasts. It assigns
//! nonces in submission order, retries transient transport failures, and
//! replaces stuck transactions at the same nonce with a higher fee.

use std::future::Future;
use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{DeployError, Result};
use crate::rpc::{CallRequest, ChainError, ChainRpc, Receipt};
use crate::signer::{DeployerIdentity, TxRequest};

/// Smallest fee increase nodes accept for a same-nonce replacement.
const MIN_FEE_BUMP_PERCENT: u64 = 10;

/// Tuning for submission, confirmation and replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionPolicy {
    /// How long to wait for a receipt before replacing a transaction.
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Same-nonce replacements after the first broadcast.
    pub max_resubmissions: u32,
    pub fee_bump_percent: u64,
    /// Retries of a single RPC request on transport failure.
    pub send_retries: usize,
    pub retry_min_delay_ms: u64,
    pub gas_limit_multiplier_percent: u64,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 120,
            poll_interval_ms: 2000,
            max_resubmissions: 3,
            fee_bump_percent: 20,
            send_retries: 5,
            retry_min_delay_ms: 500,
            gas_limit_multiplier_percent: 120,
        }
    }
}

impl SubmissionPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_min_delay_ms))
            .with_max_delay(Duration::from_secs(30))
            .with_max_times(self.send_retries)
    }

    fn bump(&self, gas_price: u128) -> u128 {
        let percent = u128::from(self.fee_bump_percent.max(MIN_FEE_BUMP_PERCENT));
        (gas_price.saturating_mul(100 + percent) / 100).max(gas_price + 1)
    }
}

/// A state-changing call the orchestrator wants on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIntent {
    /// Used in logs only.
    pub label: String,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub data: Bytes,
}

/// Result of a submission that reached the chain or was rejected by simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Confirmed(Receipt),
    /// The call reverts, either in gas estimation or in the mined transaction.
    Reverted { reason: String, data: Option<Bytes> },
}

pub struct Sequencer<C> {
    rpc: C,
    identity: DeployerIdentity,
    chain_id: u64,
    policy: SubmissionPolicy,
    next_nonce: Option<u64>,
    confirmed: u64,
}

impl<C: ChainRpc> Sequencer<C> {
    /// Query the chain id and prepare to submit as `identity`.
    pub async fn connect(rpc: C, identity: DeployerIdentity, policy: SubmissionPolicy) -> Result<Self> {
        let chain_id = retry_transient(&policy, "eth_chainId", || rpc.chain_id())
            .await
            .map_err(|e| DeployError::Submission(format!("failed to query chain id: {e}")))?;

        tracing::info!(chain_id, deployer = %identity.address(), "Connected to chain");

        Ok(Self {
            rpc,
            identity,
            chain_id,
            policy,
            next_nonce: None,
            confirmed: 0,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Transactions confirmed through this sequencer, failed receipts included.
    pub fn confirmed_transactions(&self) -> u64 {
        self.confirmed
    }

    /// Whether code is deployed at `address`.
    pub async fn has_code(&self, address: Address) -> Result<bool> {
        let code = self
            .retry("eth_getCode", || self.rpc.code_at(address))
            .await
            .map_err(|e| DeployError::Submission(format!("failed to read code at {address}: {e}")))?;
        Ok(!code.is_empty())
    }

    /// Submit `intent` and wait until it is mined.
    ///
    /// Gas is estimated first, so a call that would revert is reported as
    /// [`Outcome::Reverted`] without consuming a nonce.
    pub async fn send_and_confirm(&mut self, intent: &TxIntent) -> Result<Outcome> {
        self.send_and_confirm_with(intent, |_| Ok(())).await
    }

    /// Like [`Sequencer::send_and_confirm`], handing every hash broadcast so far
    /// to `on_broadcast` before waiting for a receipt.
    ///
    /// Callers persist the hashes there, so a transaction that lands after a
    /// [`DeployError::ConfirmationTimeout`] can be found by [`Sequencer::landed`].
    pub async fn send_and_confirm_with<F>(
        &mut self,
        intent: &TxIntent,
        mut on_broadcast: F,
    ) -> Result<Outcome>
    where
        F: FnMut(&[B256]) -> Result<()>,
    {
        let call = CallRequest {
            from: self.address(),
            to: intent.to,
            data: intent.data.clone(),
        };

        let estimate = match self.retry("eth_estimateGas", || self.rpc.estimate_gas(&call)).await {
            Ok(gas) => gas,
            Err(ChainError::Reverted { reason, data }) => {
                tracing::debug!(label = %intent.label, reason = %reason, "Call reverts in simulation");
                return Ok(Outcome::Reverted { reason, data });
            }
            Err(e) => {
                return Err(DeployError::Submission(format!(
                    "{}: gas estimation failed: {e}",
                    intent.label
                )));
            }
        };
        let gas_limit = estimate.saturating_mul(self.policy.gas_limit_multiplier_percent) / 100;

        let nonce = self.next_nonce().await?;
        let mut gas_price = self
            .retry("eth_gasPrice", || self.rpc.gas_price())
            .await
            .map_err(|e| DeployError::Submission(format!("failed to query gas price: {e}")))?;

        let attempts = self.policy.max_resubmissions + 1;
        let mut hashes: Vec<B256> = Vec::new();

        for attempt in 1..=attempts {
            let signed = self.identity.sign(
                &TxRequest {
                    nonce,
                    gas_price,
                    gas_limit,
                    to: intent.to,
                    value: U256::ZERO,
                    data: intent.data.clone(),
                },
                self.chain_id,
            )?;

            match self
                .retry("eth_sendRawTransaction", || self.rpc.send_transaction(&signed))
                .await
            {
                Ok(hash) => {
                    tracing::info!(
                        label = %intent.label,
                        nonce,
                        attempt,
                        gas_price,
                        tx_hash = %hash,
                        "Transaction submitted"
                    );
                    hashes.push(hash);
                }
                Err(ChainError::AlreadyKnown) => hashes.push(signed.hash),
                Err(ChainError::Underpriced) => {
                    tracing::warn!(label = %intent.label, nonce, gas_price, "Replacement underpriced");
                }
                Err(ChainError::NonceTooLow) if !hashes.is_empty() => {
                    // An earlier broadcast at this nonce was mined.
                    tracing::debug!(label = %intent.label, nonce, "Nonce consumed by an earlier attempt");
                }
                Err(ChainError::NonceTooLow) => {
                    self.next_nonce = None;
                    return Err(DeployError::Submission(format!(
                        "{}: nonce {nonce} is already used; is another process submitting for {}?",
                        intent.label,
                        self.address()
                    )));
                }
                Err(ChainError::Reverted { reason, data }) if hashes.is_empty() => {
                    return Ok(Outcome::Reverted { reason, data });
                }
                Err(e) => {
                    if !hashes.is_empty() {
                        self.next_nonce = None;
                    }
                    return Err(DeployError::Submission(format!("{}: {e}", intent.label)));
                }
            }

            if !hashes.is_empty() {
                on_broadcast(&hashes)?;
            }
            if !hashes.is_empty()
                && let Some(receipt) = self.await_receipt(&hashes).await?
            {
                self.next_nonce = Some(nonce + 1);
                self.confirmed += 1;
                tracing::info!(
                    label = %intent.label,
                    tx_hash = %receipt.transaction_hash,
                    block = ?receipt.block_number,
                    success = receipt.success,
                    "Transaction confirmed"
                );
                if receipt.success {
                    return Ok(Outcome::Confirmed(receipt));
                }
                return Ok(self.explain_failure(&call).await);
            }

            if attempt < attempts {
                gas_price = self.policy.bump(gas_price);
                tracing::warn!(
                    label = %intent.label,
                    nonce,
                    attempt,
                    gas_price,
                    "Transaction not confirmed in time, replacing with a higher fee"
                );
            }
        }

        // The pending transaction may still land; re-read the nonce next time.
        self.next_nonce = None;
        Err(DeployError::ConfirmationTimeout {
            nonce,
            attempts,
            tx_hash: hashes
                .last()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string()),
        })
    }

    /// Receipt of whichever of `hashes` was mined, checked once without waiting.
    pub async fn landed(&self, hashes: &[B256]) -> Result<Option<Receipt>> {
        for hash in hashes {
            let receipt = self
                .retry("eth_getTransactionReceipt", || self.rpc.transaction_receipt(*hash))
                .await
                .map_err(|e| {
                    DeployError::Submission(format!("failed to fetch receipt for {hash}: {e}"))
                })?;
            if receipt.is_some() {
                return Ok(receipt);
            }
        }
        Ok(None)
    }

    async fn next_nonce(&mut self) -> Result<u64> {
        if let Some(nonce) = self.next_nonce {
            return Ok(nonce);
        }
        let address = self.address();
        let nonce = self
            .retry("eth_getTransactionCount", || self.rpc.transaction_count(address))
            .await
            .map_err(|e| DeployError::Submission(format!("failed to query nonce: {e}")))?;
        tracing::debug!(%address, nonce, "Fetched account nonce");
        self.next_nonce = Some(nonce);
        Ok(nonce)
    }

    /// Poll every broadcast hash of the current nonce until one is mined or the
    /// confirmation timeout passes.
    async fn await_receipt(&mut self, hashes: &[B256]) -> Result<Option<Receipt>> {
        let deadline = Instant::now() + Duration::from_secs(self.policy.confirmation_timeout_secs);
        let interval = Duration::from_millis(self.policy.poll_interval_ms);

        loop {
            for hash in hashes {
                match self.rpc.transaction_receipt(*hash).await {
                    Ok(Some(receipt)) => return Ok(Some(receipt)),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        tracing::debug!(tx_hash = %hash, error = %e, "Receipt poll failed");
                    }
                    Err(e) => {
                        // The broadcast may still land; re-read the nonce next time.
                        self.next_nonce = None;
                        return Err(DeployError::Submission(format!(
                            "failed to fetch receipt for {hash}: {e}"
                        )));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Re-simulate a mined-but-failed call to recover its revert reason.
    async fn explain_failure(&self, call: &CallRequest) -> Outcome {
        match self.rpc.call(call).await {
            Err(ChainError::Reverted { reason, data }) => Outcome::Reverted { reason, data },
            _ => Outcome::Reverted {
                reason: "transaction reverted".to_string(),
                data: None,
            },
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        retry_transient(&self.policy, operation, op).await
    }
}

async fn retry_transient<T, F, Fut>(
    policy: &SubmissionPolicy,
    operation: &str,
    op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    op.retry(policy.backoff())
        .when(ChainError::is_transient)
        .notify(|err: &ChainError, dur: Duration| {
            tracing::warn!(operation, error = %err, retry_in = ?dur, "Transient RPC failure, retrying");
        })
        .await
}
