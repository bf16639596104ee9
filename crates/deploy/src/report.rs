//! Human-readable run results and address tables.

use alloy_core::primitives::Address;
use comfy_table::Table;

use crate::state::StateStore;

/// Terminal state of a unit in a run.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UnitOutcome {
    /// Recorded deployment matched the current configuration.
    Skipped { address: Address },
    /// Configuration changed but the existing deployment was kept.
    Pinned { address: Address },
    Deployed { address: Address },
    Failed { reason: String },
    /// A dependency did not reach `Deployed`.
    Blocked { dependency: String },
    /// The run halted before this unit's turn.
    NotAttempted,
    /// Outside the requested scope.
    NotRequested,
}

impl UnitOutcome {
    pub fn address(&self) -> Option<Address> {
        match self {
            UnitOutcome::Skipped { address }
            | UnitOutcome::Pinned { address }
            | UnitOutcome::Deployed { address } => Some(*address),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::Failed { .. } | UnitOutcome::Blocked { .. } | UnitOutcome::NotAttempted
        )
    }

    fn detail(&self) -> String {
        match self {
            UnitOutcome::Skipped { address }
            | UnitOutcome::Pinned { address }
            | UnitOutcome::Deployed { address } => address.to_string(),
            UnitOutcome::Failed { reason } => reason.clone(),
            UnitOutcome::Blocked { dependency } => format!("waiting on {dependency}"),
            UnitOutcome::NotAttempted | UnitOutcome::NotRequested => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub name: String,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum WiringOutcome {
    /// A record with the same idempotency key exists.
    Skipped,
    Executed { tx_reference: String },
    Failed { reason: String },
    /// Some prerequisite was not deployed in this run.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringReport {
    pub label: String,
    pub outcome: WiringOutcome,
}

/// Everything a run did, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub network: String,
    pub units: Vec<UnitReport>,
    pub wiring: Vec<WiringReport>,
    /// Transactions mined during the run.
    pub transactions: u64,
    /// The error that stopped the run early, if any.
    pub halted_by: Option<String>,
}

impl RunReport {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Self::default()
        }
    }

    pub fn push_unit(&mut self, name: &str, outcome: UnitOutcome) {
        self.units.push(UnitReport {
            name: name.to_string(),
            outcome,
        });
    }

    pub fn push_wiring(&mut self, label: String, outcome: WiringOutcome) {
        self.wiring.push(WiringReport { label, outcome });
    }

    pub fn unit(&self, name: &str) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.outcome)
    }

    pub fn succeeded(&self) -> bool {
        self.halted_by.is_none() && self.failures().is_empty()
    }

    /// Failing units and actions, each with its reason.
    pub fn failures(&self) -> Vec<String> {
        let units = self
            .units
            .iter()
            .filter(|report| report.outcome.is_failure())
            .map(|report| format!("{}: {} {}", report.name, report.outcome, report.outcome.detail()));
        let wiring = self.wiring.iter().filter_map(|report| match &report.outcome {
            WiringOutcome::Failed { reason } => Some(format!("{}: {reason}", report.label)),
            _ => None,
        });
        units.chain(wiring).map(|line| line.trim_end().to_string()).collect()
    }

    /// Per-unit and per-action table.
    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Step", "Outcome", "Detail"]);
        for report in &self.units {
            table.add_row(vec![
                report.name.clone(),
                report.outcome.to_string(),
                report.outcome.detail(),
            ]);
        }
        for report in &self.wiring {
            let detail = match &report.outcome {
                WiringOutcome::Executed { tx_reference } => tx_reference.clone(),
                WiringOutcome::Failed { reason } => reason.clone(),
                WiringOutcome::Skipped | WiringOutcome::Deferred => String::new(),
            };
            table.add_row(vec![report.label.clone(), report.outcome.to_string(), detail]);
        }
        table.to_string()
    }
}

/// Name to address table of everything recorded for a network.
pub fn address_table(store: &StateStore) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Unit", "Address", "Implementation", "Deployed at"]);

    for (name, unit) in &store.state().units {
        let Some(record) = &unit.record else {
            continue;
        };
        table.add_row(vec![
            name.clone(),
            record.live_address().to_string(),
            record
                .proxy_address
                .map(|_| record.address.to_string())
                .unwrap_or_default(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ]);
    }

    table.to_string()
}
