//! The run loop: resolve, check, then deploy and wire unit by unit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::args::{ArgResolver, EnvSource, ProcessEnv};
use crate::artifact::Artifacts;
use crate::descriptor::{DeploymentUnit, DescriptorSet};
use crate::error::{DeployError, Result};
use crate::executor::{UnitState, deploy_unit, proxy_constructor_args};
use crate::report::{RunReport, UnitOutcome, WiringOutcome};
use crate::resolver::{ExecutionOrder, resolve_scoped};
use crate::rpc::ChainRpc;
use crate::sequencer::Sequencer;
use crate::state::StateStore;
use crate::wiring::{execute_action, is_ready};

/// Switches for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Restrict the run to these units and their dependencies. Empty means all.
    pub units: Vec<String>,
    /// Redeploy units whose configuration changed since they were recorded.
    pub force: bool,
    /// On a permanent failure, block only the failed unit's dependents.
    pub keep_going: bool,
}

/// Everything a run needs, passed explicitly to each step.
pub struct DeployContext<C> {
    pub(crate) descriptors: Arc<DescriptorSet>,
    pub(crate) artifacts: Artifacts,
    pub(crate) store: StateStore,
    pub(crate) sequencer: Sequencer<C>,
    pub(crate) env: Box<dyn EnvSource + Send + Sync>,
    pub(crate) options: RunOptions,
    verification_key: Option<String>,
}

impl<C: ChainRpc> DeployContext<C> {
    pub fn new(
        descriptors: DescriptorSet,
        artifacts: Artifacts,
        store: StateStore,
        sequencer: Sequencer<C>,
        options: RunOptions,
    ) -> Self {
        Self {
            descriptors: Arc::new(descriptors),
            artifacts,
            store,
            sequencer,
            env: Box::new(ProcessEnv),
            options,
            verification_key: None,
        }
    }

    /// Replace the source of named address overrides.
    pub fn with_env(mut self, env: impl EnvSource + Send + Sync + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    /// Credential for the block explorer's verification service. Carried, never used here.
    pub fn with_verification_key(mut self, key: Option<String>) -> Self {
        self.verification_key = key;
        self
    }

    pub fn verification_key(&self) -> Option<&str> {
        self.verification_key.as_deref()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn sequencer(&self) -> &Sequencer<C> {
        &self.sequencer
    }

    pub(crate) fn arg_resolver(&self) -> ArgResolver<'_> {
        ArgResolver {
            deployer: self.sequencer.address(),
            env: &*self.env,
            store: &self.store,
        }
    }

    /// Deploy and wire the requested units.
    ///
    /// Descriptor, ordering and artifact problems are returned as errors before any
    /// transaction is sent. Failures after that point are reported per unit or
    /// action in the returned [`RunReport`].
    pub async fn run(&mut self) -> Result<RunReport> {
        let descriptors = Arc::clone(&self.descriptors);
        let order = resolve_scoped(&descriptors, &self.options.units)?;
        self.preflight(&order)?;
        self.store.bind_chain(self.sequencer.chain_id())?;

        tracing::info!(
            network = %self.store.network(),
            units = order.len(),
            deployer = %self.sequencer.address(),
            order = ?*order,
            verification = self.verification_key.is_some(),
            "Starting deployment run"
        );

        let mut report = RunReport::new(self.store.network());
        let mut states: HashMap<&str, UnitState> =
            order.iter().map(|name| (name.as_str(), UnitState::Pending)).collect();
        let mut deployed: HashSet<String> = HashSet::new();
        let mut attempted: HashSet<usize> = HashSet::new();

        for name in order.iter() {
            if report.halted_by.is_some() {
                report.push_unit(name, UnitOutcome::NotAttempted);
                continue;
            }
            let Some(unit) = descriptors.unit(name) else {
                continue;
            };

            if let Some(dependency) = unit
                .dependencies
                .iter()
                .find(|dep| states.get(dep.as_str()) != Some(&UnitState::Deployed))
            {
                tracing::warn!(unit = %name, dependency = %dependency, "Dependency not deployed, skipping unit");
                states.insert(name, UnitState::Failed);
                report.push_unit(
                    name,
                    UnitOutcome::Blocked {
                        dependency: dependency.clone(),
                    },
                );
                continue;
            }

            states.insert(name, UnitState::Resolving);
            tracing::info!(unit = %name, "Resolving unit");

            match deploy_unit(self, unit).await {
                Ok(outcome) => {
                    states.insert(name, UnitState::Deployed);
                    deployed.insert(name.clone());
                    report.push_unit(name, outcome);
                    self.run_ready_wiring(&deployed, &mut attempted, &mut report)
                        .await;
                }
                Err(err) => {
                    tracing::error!(unit = %name, error = %err, "Unit failed");
                    states.insert(name, UnitState::Failed);
                    report.push_unit(
                        name,
                        UnitOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                    self.halt_unless_contained(&err, &mut report);
                }
            }
        }

        for (index, action) in descriptors.wiring.iter().enumerate() {
            if !attempted.contains(&index) {
                report.push_wiring(action.label(), WiringOutcome::Deferred);
            }
        }
        for unit in descriptors.iter() {
            if !states.contains_key(unit.name.as_str()) {
                report.push_unit(&unit.name, UnitOutcome::NotRequested);
            }
        }
        report.transactions = self.sequencer.confirmed_transactions();

        tracing::info!(
            network = %report.network,
            transactions = report.transactions,
            success = report.succeeded(),
            "Deployment run finished"
        );
        Ok(report)
    }

    /// Execute, in declaration order, every not yet attempted action whose
    /// prerequisites are all deployed.
    async fn run_ready_wiring(
        &mut self,
        deployed: &HashSet<String>,
        attempted: &mut HashSet<usize>,
        report: &mut RunReport,
    ) {
        let descriptors = Arc::clone(&self.descriptors);

        for (index, action) in descriptors.wiring.iter().enumerate() {
            if report.halted_by.is_some() {
                return;
            }
            if attempted.contains(&index) || !is_ready(action, deployed) {
                continue;
            }
            attempted.insert(index);

            match execute_action(self, action).await {
                Ok(outcome) => report.push_wiring(action.label(), outcome),
                Err(err) => {
                    tracing::error!(action = %action.label(), error = %err, "Wiring failed");
                    report.push_wiring(
                        action.label(),
                        WiringOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                    self.halt_unless_contained(&err, report);
                }
            }
        }
    }

    fn halt_unless_contained(&self, err: &DeployError, report: &mut RunReport) {
        if !self.options.keep_going || err.halts_run() {
            report.halted_by = Some(err.to_string());
        }
    }

    /// Check artifacts and ABI shapes of everything in scope before sending anything.
    fn preflight(&mut self, order: &ExecutionOrder) -> Result<()> {
        let descriptors = Arc::clone(&self.descriptors);
        let in_scope: HashSet<&str> = order.iter().map(String::as_str).collect();

        for unit in order.iter().filter_map(|name| descriptors.unit(name)) {
            self.check_unit(unit)?;
        }

        for action in &descriptors.wiring {
            if !action.prerequisites().iter().all(|unit| in_scope.contains(unit)) {
                continue;
            }
            let target = descriptors.unit(&action.target).ok_or_else(|| {
                DeployError::config(format!("wiring target '{}' is not declared", action.target))
            })?;
            self.artifacts
                .load(&target.implementation)?
                .check_method(&action.method, action.args.len())?;
        }
        Ok(())
    }

    fn check_unit(&mut self, unit: &DeploymentUnit) -> Result<()> {
        let artifact = self.artifacts.load(&unit.implementation)?;
        if artifact.constructor_arity() != unit.constructor_args.len() {
            return Err(DeployError::config(format!(
                "unit '{}': constructor of '{}' takes {} arguments, {} given",
                unit.name,
                unit.implementation,
                artifact.constructor_arity(),
                unit.constructor_args.len()
            )));
        }

        if let Some(proxy) = &unit.proxy {
            artifact.check_method(&proxy.initializer.method, proxy.initializer.args.len())?;
            let proxy_artifact = self.artifacts.load(&proxy.kind)?;
            proxy_constructor_args(&proxy_artifact, self.sequencer.address(), "")?;
        }
        Ok(())
    }
}
