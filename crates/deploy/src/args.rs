//! Resolution of descriptor argument values into concrete strings.

use std::collections::HashMap;
use std::str::FromStr;

use alloy_core::primitives::Address;

use crate::descriptor::{ArgValue, DeploymentUnit, NamedAccount};
use crate::error::{DeployError, Result};
use crate::state::StateStore;

/// Source of named environment overrides.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads overrides from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Resolve an address override: a present, well-formed value is used verbatim,
/// anything else falls back to the deploying identity.
pub fn resolve_env_address(name: &str, env: &dyn EnvSource, deployer: Address) -> String {
    match env.var(name) {
        Some(value) if Address::from_str(&value).is_ok() => value,
        Some(value) if !value.is_empty() => {
            tracing::warn!(
                var = name,
                value = %value,
                fallback = %deployer,
                "Address override is malformed, falling back to deployer"
            );
            deployer.to_string()
        }
        _ => deployer.to_string(),
    }
}

/// Everything needed to turn an [`ArgValue`] into the string handed to ABI coercion.
pub struct ArgResolver<'a> {
    pub deployer: Address,
    pub env: &'a dyn EnvSource,
    pub store: &'a StateStore,
}

impl ArgResolver<'_> {
    /// Resolve one value. `scope` names the unit or action for error reporting.
    pub fn resolve(&self, scope: &str, value: &ArgValue) -> Result<String> {
        match value {
            ArgValue::Literal(literal) => Ok(literal.render()),
            ArgValue::Env { env } => Ok(resolve_env_address(env, self.env, self.deployer)),
            ArgValue::Account {
                account: NamedAccount::Deployer,
            } => Ok(self.deployer.to_string()),
            ArgValue::AddressOf { address_of } => self
                .store
                .live_address(address_of)
                .map(|address| address.to_string())
                .ok_or_else(|| DeployError::InternalOrdering {
                    action: scope.to_string(),
                    missing: address_of.clone(),
                }),
        }
    }

    pub fn resolve_all(&self, scope: &str, values: &[ArgValue]) -> Result<Vec<String>> {
        values.iter().map(|v| self.resolve(scope, v)).collect()
    }

    pub fn resolve_unit(&self, unit: &DeploymentUnit) -> Result<ResolvedArgs> {
        let constructor = self.resolve_all(&unit.name, &unit.constructor_args)?;
        let (proxy_owner, initializer) = match &unit.proxy {
            Some(proxy) => (
                Some(self.resolve(&unit.name, &proxy.owner)?),
                self.resolve_all(&unit.name, &proxy.initializer.args)?,
            ),
            None => (None, Vec::new()),
        };
        Ok(ResolvedArgs {
            constructor,
            proxy_owner,
            initializer,
        })
    }
}

/// A unit's arguments after resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedArgs {
    pub constructor: Vec<String>,
    pub proxy_owner: Option<String>,
    pub initializer: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;

    const DEPLOYER: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_absent_override_falls_back_to_deployer() {
        let resolved = resolve_env_address("TRUST_SIGNER_ADDRESS", &env(&[]), DEPLOYER);
        assert_eq!(resolved, DEPLOYER.to_string());
    }

    #[test]
    fn test_present_override_used_verbatim() {
        let value = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
        let resolved = resolve_env_address(
            "TRUST_SIGNER_ADDRESS",
            &env(&[("TRUST_SIGNER_ADDRESS", value)]),
            DEPLOYER,
        );
        assert_eq!(resolved, value);
    }

    #[test]
    fn test_malformed_override_falls_back() {
        for bad in ["0x1234", "not-an-address", ""] {
            let resolved = resolve_env_address(
                "TRUST_SIGNER_ADDRESS",
                &env(&[("TRUST_SIGNER_ADDRESS", bad)]),
                DEPLOYER,
            );
            assert_eq!(resolved, DEPLOYER.to_string(), "value {bad:?}");
        }
    }
}
