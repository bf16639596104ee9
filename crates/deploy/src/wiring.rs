//! Execution of wiring actions once their prerequisites are deployed.

use std::collections::HashSet;

use chrono::Utc;

use crate::descriptor::WiringAction;
use crate::error::{DeployError, Result};
use crate::executor::revert_error;
use crate::fingerprint::idempotency_key;
use crate::orchestrator::DeployContext;
use crate::report::WiringOutcome;
use crate::rpc::ChainRpc;
use crate::sequencer::{Outcome, TxIntent};
use crate::state::{REMOTE_GUARD_REFERENCE, WiringRecord};

/// Whether every unit `action` depends on reached `Deployed` in this run.
pub fn is_ready(action: &WiringAction, deployed: &HashSet<String>) -> bool {
    action
        .prerequisites()
        .into_iter()
        .all(|unit| deployed.contains(unit))
}

/// Run `action` unless a record with the same idempotency key exists.
pub async fn execute_action<C: ChainRpc>(
    ctx: &mut DeployContext<C>,
    action: &WiringAction,
) -> Result<WiringOutcome> {
    let label = action.label();
    let args = ctx.arg_resolver().resolve_all(&label, &action.args)?;
    let target = ctx
        .store
        .live_address(&action.target)
        .ok_or_else(|| DeployError::InternalOrdering {
            action: label.clone(),
            missing: action.target.clone(),
        })?;

    let key = idempotency_key(action, target, &args);
    if let Some(record) = ctx.store.wiring_record(&action.target, &key) {
        tracing::info!(
            action = %label,
            key = %key,
            tx = %record.tx_reference,
            "Wiring already executed, skipping"
        );
        return Ok(WiringOutcome::Skipped);
    }

    let implementation = ctx
        .descriptors
        .unit(&action.target)
        .map(|unit| unit.implementation.clone())
        .ok_or_else(|| DeployError::InternalOrdering {
            action: label.clone(),
            missing: action.target.clone(),
        })?;
    let data = ctx
        .artifacts
        .load(&implementation)?
        .call_data(&action.method, &args)?;

    if let Some(reference) = landed_earlier(ctx, &action.target, &key, &label).await? {
        record_wiring(ctx, action, &key, args, reference.clone())?;
        return Ok(WiringOutcome::Executed {
            tx_reference: reference,
        });
    }

    let intent = TxIntent {
        label: label.clone(),
        to: Some(target),
        data,
    };
    let store = &mut ctx.store;
    let outcome = ctx
        .sequencer
        .send_and_confirm_with(&intent, |hashes| {
            store.set_wiring_broadcast(&action.target, &key, hashes.to_vec())
        })
        .await?;
    let tx_reference = match outcome {
        Outcome::Confirmed(receipt) => receipt.transaction_hash.to_string(),
        Outcome::Reverted { reason, data } => {
            match revert_error(&action.target, &action.method, reason, data.as_ref()) {
                DeployError::AlreadyInitialized { .. } => {
                    tracing::info!(action = %label, "Target reports the call as already applied");
                    REMOTE_GUARD_REFERENCE.to_string()
                }
                err => return Err(err),
            }
        }
    };

    record_wiring(ctx, action, &key, args, tx_reference.clone())?;
    tracing::info!(action = %label, key = %key, tx = %tx_reference, "Wiring executed");
    Ok(WiringOutcome::Executed { tx_reference })
}

/// Hash of a call an earlier run broadcast and gave up on, if it has since succeeded.
async fn landed_earlier<C: ChainRpc>(
    ctx: &DeployContext<C>,
    target: &str,
    key: &str,
    label: &str,
) -> Result<Option<String>> {
    let Some(hashes) = ctx.store.wiring_broadcast(target, key) else {
        return Ok(None);
    };
    match ctx.sequencer.landed(hashes).await? {
        Some(receipt) if receipt.success => {
            tracing::info!(
                action = %label,
                tx = %receipt.transaction_hash,
                "Earlier wiring call landed after the run gave up on it"
            );
            Ok(Some(receipt.transaction_hash.to_string()))
        }
        _ => Ok(None),
    }
}

fn record_wiring<C: ChainRpc>(
    ctx: &mut DeployContext<C>,
    action: &WiringAction,
    key: &str,
    args: Vec<String>,
    tx_reference: String,
) -> Result<()> {
    ctx.store.put_wiring(
        &action.target,
        WiringRecord {
            idempotency_key: key.to_string(),
            method: action.method.clone(),
            args,
            executed_at: Utc::now(),
            tx_reference,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_needs_target_and_references() {
        let action = WiringAction {
            target: "CellIDRegistry".to_string(),
            method: "setController".to_string(),
            args: vec![crate::descriptor::ArgValue::AddressOf {
                address_of: "ResolveController".to_string(),
            }],
        };

        let mut deployed = HashSet::from(["CellIDRegistry".to_string()]);
        assert!(!is_ready(&action, &deployed));

        deployed.insert("ResolveController".to_string());
        assert!(is_ready(&action, &deployed));
    }
}
