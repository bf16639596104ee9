//! cellup-deploy - Deployment orchestration for upgradeable contract sets.
//!
//! Units declared in a descriptor file are ordered by their dependencies, deployed
//! behind proxies (or directly), initialized once, and wired together. Everything
//! confirmed on chain is recorded per network so a rerun skips finished work and
//! resumes interrupted steps.

mod args;
mod artifact;
mod config;
mod deployer;
mod descriptor;
mod error;
mod executor;
mod fingerprint;
mod orchestrator;
mod report;
mod resolver;
mod rpc;
mod sequencer;
mod signer;
mod state;
mod wiring;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use args::{ArgResolver, EnvSource, ProcessEnv, ResolvedArgs, resolve_env_address};
pub use artifact::{Artifact, Artifacts};
pub use config::{CONFIG_FILENAME, Config, NetworkConfig};
pub use deployer::{Credentials, Deployer};
pub use descriptor::{
    ArgValue, DESCRIPTORS_FILENAME, DeploymentUnit, DescriptorSet, Initializer, Literal,
    NamedAccount, ProxyConfig, WiringAction,
};
pub use error::{DeployError, Result};
pub use executor::{UnitState, deploy_unit};
pub use fingerprint::{UnitFingerprint, idempotency_key};
pub use orchestrator::{DeployContext, RunOptions};
pub use report::{
    RunReport, UnitOutcome, UnitReport, WiringOutcome, WiringReport, address_table,
};
pub use resolver::{ExecutionOrder, resolve, resolve_scoped};
pub use rpc::{CallRequest, ChainError, ChainRpc, HttpRpc, Receipt, RevertKind, classify_revert};
pub use sequencer::{Outcome, Sequencer, SubmissionPolicy, TxIntent};
pub use signer::{DeployerIdentity, SignedTransaction, TxRequest};
pub use state::{
    DeploymentRecord, NetworkState, PendingDeployment, REMOTE_GUARD_REFERENCE, StateStore,
    UnitEntry, WiringRecord,
};
pub use wiring::execute_action;
