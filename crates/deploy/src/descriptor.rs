//! Declarative description of the units to deploy and the wiring between them.
//!
//! Descriptors are loaded from a TOML file (`Deployments.toml` by default):
//!
//! ```toml
//! [[unit]]
//! name = "CellIDRegistry"
//! implementation = "CellIDRegistry"
//! skip_if_already_deployed = true
//!
//! [unit.proxy]
//! owner = { account = "deployer" }
//! kind = "OptimizedTransparentProxy"
//! initializer = { method = "initialize", args = ["Cell ID", "CELLID"] }
//!
//! [[wiring]]
//! target = "CellIDRegistry"
//! method = "setController"
//! args = [{ address_of = "ResolveController" }]
//! ```

use std::collections::HashSet;
use std::path::Path;

use derive_more::Deref;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// The default name for the descriptor file.
pub const DESCRIPTORS_FILENAME: &str = "Deployments.toml";

/// Accounts that can be referenced by name from descriptors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NamedAccount {
    /// The single identity signing every transaction of the run.
    Deployer,
}

/// A plain value written in the descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Literal>),
}

impl Literal {
    /// Render the literal in the textual form accepted by ABI type coercion.
    pub fn render(&self) -> String {
        match self {
            Literal::Bool(b) => b.to_string(),
            Literal::Int(i) => i.to_string(),
            Literal::Str(s) => s.clone(),
            Literal::List(items) => {
                let items: Vec<String> = items.iter().map(Literal::render).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }
}

/// A constructor, initializer or wiring argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Address taken from an environment variable, falling back to the deployer.
    Env { env: String },
    /// Live address of another unit.
    AddressOf { address_of: String },
    /// Address of a named account.
    Account { account: NamedAccount },
    Literal(Literal),
}

impl ArgValue {
    /// Name of the unit this value points at, if any.
    pub fn unit_ref(&self) -> Option<&str> {
        match self {
            ArgValue::AddressOf { address_of } => Some(address_of),
            _ => None,
        }
    }
}

/// One-time initializer invoked through the proxy after deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initializer {
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
}

/// Upgradeable proxy configuration for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Admin of the proxy.
    pub owner: ArgValue,
    /// Artifact name of the proxy program.
    pub kind: String,
    pub initializer: Initializer,
}

/// A single deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentUnit {
    /// Unique name, stable across runs.
    pub name: String,
    /// Artifact name of the compiled implementation.
    pub implementation: String,
    /// Absent means the implementation is deployed directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub constructor_args: Vec<ArgValue>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub skip_if_already_deployed: bool,
}

impl DeploymentUnit {
    /// Every argument value the unit resolves while deploying.
    pub fn arg_values(&self) -> impl Iterator<Item = &ArgValue> {
        let proxy_values = self.proxy.iter().flat_map(|proxy| {
            std::iter::once(&proxy.owner).chain(proxy.initializer.args.iter())
        });
        self.constructor_args.iter().chain(proxy_values)
    }
}

/// A post-deployment call recording one unit's address inside another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringAction {
    /// Unit receiving the call.
    pub target: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
}

impl WiringAction {
    /// Human readable label, e.g. `CellIDRegistry.setController`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.target, self.method)
    }

    /// Units that must be deployed before this action can run.
    pub fn prerequisites(&self) -> Vec<&str> {
        let mut units = vec![self.target.as_str()];
        for name in self.args.iter().filter_map(ArgValue::unit_ref) {
            if !units.contains(&name) {
                units.push(name);
            }
        }
        units
    }
}

/// The full, immutable set of descriptors for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref)]
pub struct DescriptorSet {
    #[deref]
    #[serde(rename = "unit", default)]
    pub units: Vec<DeploymentUnit>,
    #[serde(rename = "wiring", default)]
    pub wiring: Vec<WiringAction>,
}

impl DescriptorSet {
    /// Parse and validate descriptors from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let set: Self = toml::from_str(content)
            .map_err(|e| DeployError::config(format!("failed to parse descriptors: {e}")))?;
        set.validate()?;
        Ok(set)
    }

    /// Load and validate descriptors from a file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::config(format!("failed to read descriptors {}: {e}", path.display()))
        })?;
        let set = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.display(),
            units = set.units.len(),
            wiring = set.wiring.len(),
            "Descriptors loaded"
        );
        Ok(set)
    }

    pub fn unit(&self, name: &str) -> Option<&DeploymentUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Check structural soundness. Unknown dependency names are left to the resolver.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() {
                return Err(DeployError::config("unit with an empty name"));
            }
            if unit.implementation.trim().is_empty() {
                return Err(DeployError::config(format!(
                    "unit '{}' has no implementation",
                    unit.name
                )));
            }
            if !seen.insert(unit.name.as_str()) {
                return Err(DeployError::config(format!(
                    "unit '{}' is declared more than once",
                    unit.name
                )));
            }
        }

        for unit in &self.units {
            for reference in unit.arg_values().filter_map(ArgValue::unit_ref) {
                if !seen.contains(reference) {
                    return Err(DeployError::config(format!(
                        "unit '{}' references the address of unknown unit '{reference}'",
                        unit.name
                    )));
                }
                if !unit.dependencies.iter().any(|d| d == reference) {
                    return Err(DeployError::config(format!(
                        "unit '{}' uses the address of '{reference}' without declaring it as a dependency",
                        unit.name
                    )));
                }
            }
        }

        for action in &self.wiring {
            for unit in action.prerequisites() {
                if !seen.contains(unit) {
                    return Err(DeployError::config(format!(
                        "wiring action '{}' references unknown unit '{unit}'",
                        action.label()
                    )));
                }
            }
        }

        Ok(())
    }
}
