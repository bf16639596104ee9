//! Deployment of a single unit: implementation, optional proxy, initializer.

use alloy_core::primitives::{Address, Bytes};
use chrono::Utc;

use crate::artifact::Artifact;
use crate::descriptor::DeploymentUnit;
use crate::error::{DeployError, Result};
use crate::fingerprint::UnitFingerprint;
use crate::orchestrator::DeployContext;
use crate::report::UnitOutcome;
use crate::rpc::{ChainRpc, RevertKind, classify_revert};
use crate::sequencer::{Outcome, TxIntent};
use crate::state::{DeploymentRecord, PendingDeployment};

const IMPLEMENTATION: &str = "implementation";
const PROXY: &str = "proxy";

/// Lifecycle of a unit within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UnitState {
    Pending,
    Resolving,
    Deployed,
    Failed,
}

/// Map a revert on `target.method` to the error it represents.
pub(crate) fn revert_error(target: &str, method: &str, reason: String, data: Option<&Bytes>) -> DeployError {
    match classify_revert(&reason, data) {
        RevertKind::AlreadyInitialized => DeployError::AlreadyInitialized {
            target: target.to_string(),
        },
        RevertKind::Unauthorized => DeployError::Authorization {
            target: target.to_string(),
            method: method.to_string(),
            reason,
        },
        RevertKind::Other => DeployError::Reverted {
            target: target.to_string(),
            method: method.to_string(),
            reason,
        },
    }
}

/// The proxy constructor takes `(logic, admin, data)` or `(logic, admin)`.
pub(crate) fn proxy_constructor_args(
    proxy: &Artifact,
    implementation: Address,
    owner: &str,
) -> Result<Vec<String>> {
    match proxy.constructor_arity() {
        3 => Ok(vec![implementation.to_string(), owner.to_string(), "0x".to_string()]),
        2 => Ok(vec![implementation.to_string(), owner.to_string()]),
        arity => Err(DeployError::config(format!(
            "proxy '{}' constructor takes {arity} arguments, expected (implementation, owner[, data])",
            proxy.name
        ))),
    }
}

/// Bring `unit` to `Deployed`, skipping or resuming whatever is already on chain.
pub async fn deploy_unit<C: ChainRpc>(
    ctx: &mut DeployContext<C>,
    unit: &DeploymentUnit,
) -> Result<UnitOutcome> {
    let artifact = ctx.artifacts.load(&unit.implementation)?;
    let args = ctx.arg_resolver().resolve_unit(unit)?;
    let fingerprint = UnitFingerprint::new(unit, &artifact.bytecode, &args).compute_hash();

    if let Some(record) = ctx.store.record(&unit.name).cloned() {
        let address = record.live_address();
        if !ctx.sequencer.has_code(address).await? {
            tracing::warn!(
                unit = %unit.name,
                %address,
                "Recorded deployment has no code on chain, deploying again"
            );
        } else if record.argument_fingerprint == fingerprint {
            tracing::info!(unit = %unit.name, %address, "Unit unchanged, skipping");
            return Ok(UnitOutcome::Skipped { address });
        } else if ctx.options.force {
            tracing::info!(unit = %unit.name, previous = %address, "Unit changed, redeploying");
        } else if unit.skip_if_already_deployed {
            tracing::warn!(
                unit = %unit.name,
                %address,
                "Unit changed since deployment, keeping the existing one (use --force to redeploy)"
            );
            return Ok(UnitOutcome::Pinned { address });
        } else {
            return Err(DeployError::config(format!(
                "unit '{}' changed since it was deployed at {address}; rerun with --force to redeploy",
                unit.name
            )));
        }
    }

    // Encode everything up front so bad arguments fail before the first transaction.
    let deploy_data = artifact.deploy_data(&args.constructor)?;
    let init_data = unit
        .proxy
        .as_ref()
        .map(|proxy| artifact.call_data(&proxy.initializer.method, &args.initializer))
        .transpose()?;

    let resume = ctx
        .store
        .pending(&unit.name)
        .filter(|pending| pending.fingerprint == fingerprint)
        .cloned()
        .unwrap_or_default();
    let mut checkpoint = PendingDeployment {
        fingerprint: fingerprint.clone(),
        broadcast: resume.broadcast.clone(),
        ..PendingDeployment::default()
    };

    let recovered =
        recover_step(ctx, &unit.name, IMPLEMENTATION, resume.implementation, &resume).await?;
    let fresh_implementation = recovered.is_none();
    let implementation = match recovered {
        Some(address) => address,
        None => create(ctx, &unit.name, IMPLEMENTATION, deploy_data, &mut checkpoint).await?,
    };

    let (Some(proxy), Some(init_data)) = (&unit.proxy, init_data) else {
        return finish(ctx, unit, fingerprint, implementation, None);
    };

    checkpoint.implementation = Some(implementation);
    checkpoint.broadcast.remove(IMPLEMENTATION);
    if fresh_implementation {
        // A proxy from an earlier attempt points at the old implementation.
        checkpoint.broadcast.remove(PROXY);
    }
    ctx.store.set_pending(&unit.name, checkpoint.clone())?;

    let earlier_proxy = if fresh_implementation {
        None
    } else {
        recover_step(ctx, &unit.name, PROXY, resume.proxy, &checkpoint).await?
    };
    let proxy_address = match earlier_proxy {
        Some(address) => address,
        None => {
            let proxy_artifact = ctx.artifacts.load(&proxy.kind)?;
            let owner = args.proxy_owner.as_deref().unwrap_or_default();
            let constructor = proxy_constructor_args(&proxy_artifact, implementation, owner)?;
            let data = proxy_artifact.deploy_data(&constructor)?;
            create(ctx, &unit.name, PROXY, data, &mut checkpoint).await?
        }
    };
    checkpoint.proxy = Some(proxy_address);
    checkpoint.broadcast.remove(PROXY);
    ctx.store.set_pending(&unit.name, checkpoint)?;

    let method = &proxy.initializer.method;
    let intent = TxIntent {
        label: format!("{}.{method}", unit.name),
        to: Some(proxy_address),
        data: init_data,
    };
    match ctx.sequencer.send_and_confirm(&intent).await? {
        Outcome::Confirmed(_) => {
            tracing::info!(unit = %unit.name, proxy = %proxy_address, "Proxy initialized");
        }
        Outcome::Reverted { reason, data } => {
            match revert_error(&unit.name, method, reason, data.as_ref()) {
                DeployError::AlreadyInitialized { .. } => tracing::info!(
                    unit = %unit.name,
                    proxy = %proxy_address,
                    "Proxy was already initialized, treating as success"
                ),
                err => return Err(err),
            }
        }
    }

    finish(ctx, unit, fingerprint, implementation, Some(proxy_address))
}

/// Address of a step an earlier run already got on chain, if any.
///
/// A checkpointed address counts only if code is there. Otherwise the receipts of
/// creation transactions broadcast for the step are checked, since one may have
/// landed after that run gave up waiting.
async fn recover_step<C: ChainRpc>(
    ctx: &DeployContext<C>,
    unit: &str,
    step: &str,
    checkpointed: Option<Address>,
    pending: &PendingDeployment,
) -> Result<Option<Address>> {
    if let Some(address) = checkpointed {
        if ctx.sequencer.has_code(address).await? {
            tracing::info!(unit, step, %address, "Resuming from confirmed step");
            return Ok(Some(address));
        }
        tracing::warn!(unit, step, %address, "Checkpointed address has no code, deploying again");
    }

    let Some(hashes) = pending.broadcast.get(step).filter(|hashes| !hashes.is_empty()) else {
        return Ok(None);
    };
    let Some(receipt) = ctx.sequencer.landed(hashes).await? else {
        tracing::warn!(
            unit,
            step,
            broadcast = hashes.len(),
            "Earlier creation never landed, deploying again"
        );
        return Ok(None);
    };

    match receipt.contract_address {
        Some(address) if receipt.success && ctx.sequencer.has_code(address).await? => {
            tracing::info!(
                unit,
                step,
                %address,
                tx_hash = %receipt.transaction_hash,
                "Earlier creation landed after the run gave up on it"
            );
            Ok(Some(address))
        }
        _ => {
            tracing::warn!(
                unit,
                step,
                tx_hash = %receipt.transaction_hash,
                "Earlier creation failed, deploying again"
            );
            Ok(None)
        }
    }
}

/// Deploy `data`, checkpointing every broadcast hash before waiting on it.
async fn create<C: ChainRpc>(
    ctx: &mut DeployContext<C>,
    unit: &str,
    step: &str,
    data: Bytes,
    checkpoint: &mut PendingDeployment,
) -> Result<Address> {
    let intent = TxIntent {
        label: format!("{unit}:{step}"),
        to: None,
        data,
    };
    let store = &mut ctx.store;
    let outcome = ctx
        .sequencer
        .send_and_confirm_with(&intent, |hashes| {
            checkpoint.broadcast.insert(step.to_string(), hashes.to_vec());
            store.set_pending(unit, checkpoint.clone())
        })
        .await?;

    match outcome {
        Outcome::Confirmed(receipt) => {
            let address = receipt.contract_address.ok_or_else(|| {
                DeployError::Submission(format!("{}: receipt has no contract address", intent.label))
            })?;
            tracing::info!(unit, step, %address, tx_hash = %receipt.transaction_hash, "Contract deployed");
            Ok(address)
        }
        Outcome::Reverted { reason, data } => Err(revert_error(unit, "constructor", reason, data.as_ref())),
    }
}

fn finish<C: ChainRpc>(
    ctx: &mut DeployContext<C>,
    unit: &DeploymentUnit,
    fingerprint: String,
    implementation: Address,
    proxy_address: Option<Address>,
) -> Result<UnitOutcome> {
    let record = DeploymentRecord {
        name: unit.name.clone(),
        network: ctx.store.network().to_string(),
        address: implementation,
        proxy_address,
        argument_fingerprint: fingerprint,
        initialized: true,
        timestamp: Utc::now(),
    };
    let address = record.live_address();
    ctx.store.put_record(record)?;

    tracing::info!(unit = %unit.name, %address, "Unit deployed");
    Ok(UnitOutcome::Deployed { address })
}
