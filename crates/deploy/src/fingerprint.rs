use alloy_core::primitives::{Address, keccak256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::args::ResolvedArgs;
use crate::descriptor::{DeploymentUnit, WiringAction};

/// Proxy-related inputs of a unit's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyFingerprint {
    pub kind: String,
    pub owner: String,
    pub initializer_method: String,
    pub initializer_args: Vec<String>,
}

/// Everything that, when changed, makes an existing deployment stale.
///
/// Arguments are captured after resolution, so an environment override that changes
/// between runs changes the fingerprint too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFingerprint {
    pub implementation: String,
    /// Keccak-256 of the creation bytecode.
    pub bytecode_hash: String,
    pub constructor_args: Vec<String>,
    pub proxy: Option<ProxyFingerprint>,
}

impl UnitFingerprint {
    pub fn new(unit: &DeploymentUnit, bytecode: &[u8], args: &ResolvedArgs) -> Self {
        Self {
            implementation: unit.implementation.clone(),
            bytecode_hash: keccak256(bytecode).to_string(),
            constructor_args: args.constructor.clone(),
            proxy: unit.proxy.as_ref().map(|proxy| ProxyFingerprint {
                kind: proxy.kind.clone(),
                owner: args.proxy_owner.clone().unwrap_or_default(),
                initializer_method: proxy.initializer.method.clone(),
                initializer_args: args.initializer.clone(),
            }),
        }
    }

    /// Compute a SHA-256 hash of this fingerprint.
    ///
    /// The hash is deterministic: struct fields serialize in declaration order.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_string(self)
            .expect("UnitFingerprint serialization should never fail");
        sha256_hex(json.as_bytes())
    }
}

#[derive(Serialize)]
struct WiringKeyInput<'a> {
    target: &'a str,
    target_address: String,
    method: &'a str,
    args: &'a [String],
}

/// Stable identifier of a wiring action with its resolved arguments.
///
/// The readable prefix keeps state files inspectable; the hash suffix changes when
/// the target is redeployed or any resolved argument changes.
pub fn idempotency_key(action: &WiringAction, target_address: Address, args: &[String]) -> String {
    let input = WiringKeyInput {
        target: &action.target,
        target_address: target_address.to_string(),
        method: &action.method,
        args,
    };
    let json =
        serde_json::to_string(&input).expect("WiringKeyInput serialization should never fail");
    let hash = sha256_hex(json.as_bytes());
    format!("{}#{}", action.label(), &hash[..16])
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
