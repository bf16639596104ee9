//! Error taxonomy for the deployment orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the orchestration core.
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Malformed descriptor, unknown reference or bad artifact.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cyclic dependency between units: {}", members.join(", "))]
    CyclicDependency { members: Vec<String> },

    #[error("unit '{unit}' depends on unknown unit '{missing}'")]
    UnresolvedDependency { unit: String, missing: String },

    /// Transient network or RPC failure while sending a transaction.
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("transaction with nonce {nonce} not confirmed after {attempts} attempt(s) (last hash {tx_hash})")]
    ConfirmationTimeout {
        nonce: u64,
        attempts: u32,
        tx_hash: String,
    },

    #[error("deploying identity is not authorized to call {target}.{method}: {reason}")]
    Authorization {
        target: String,
        method: String,
        reason: String,
    },

    /// The remote program's single-initialization guard fired.
    #[error("{target} is already initialized")]
    AlreadyInitialized { target: String },

    #[error("{target}.{method} reverted: {reason}")]
    Reverted {
        target: String,
        method: String,
        reason: String,
    },

    #[error("wiring action '{action}' references '{missing}' which has no deployment record")]
    InternalOrdering { action: String, missing: String },

    #[error("state store error at {path}: {source}")]
    StateStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupted: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another deployment run holds the lock {path}")]
    Locked { path: PathBuf },
}

impl DeployError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether re-running the orchestration later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Submission(_) | Self::ConfirmationTimeout { .. } | Self::Locked { .. }
        )
    }

    /// Whether this error must stop the whole run even in keep-going mode.
    pub fn halts_run(&self) -> bool {
        matches!(
            self,
            Self::ConfirmationTimeout { .. }
                | Self::Submission(_)
                | Self::InternalOrdering { .. }
                | Self::StateStore { .. }
                | Self::StateCorrupt { .. }
                | Self::Locked { .. }
        )
    }
}
