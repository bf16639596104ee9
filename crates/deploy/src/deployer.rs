use anyhow::{Context, Result};
use url::Url;

use crate::args::ProcessEnv;
use crate::artifact::Artifacts;
use crate::config::Config;
use crate::descriptor::DescriptorSet;
use crate::orchestrator::{DeployContext, RunOptions};
use crate::report::{RunReport, address_table};
use crate::resolver::resolve_scoped;
use crate::rpc::HttpRpc;
use crate::sequencer::Sequencer;
use crate::signer::DeployerIdentity;
use crate::state::StateStore;

/// Secrets and per-invocation overrides, supplied by the caller rather than the config file.
#[derive(Default)]
pub struct Credentials {
    pub private_key: Option<String>,
    pub rpc_url: Option<Url>,
    pub verification_key: Option<String>,
}

/// Entry point binding a loaded [`Config`] to the commands.
pub struct Deployer {
    pub config: Config,
}

impl Deployer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the orchestrator against `network` over JSON-RPC.
    pub async fn deploy(
        &self,
        network: &str,
        credentials: Credentials,
        options: RunOptions,
    ) -> Result<RunReport> {
        let network_config = self.config.network(network)?;
        let rpc_url = credentials
            .rpc_url
            .or_else(|| network_config.rpc_url.clone())
            .with_context(|| format!("No RPC URL for network '{network}'"))?;
        let private_key = credentials
            .private_key
            .context("No deployer key provided (set DEPLOYER_KEY or pass --private-key)")?;
        let identity = DeployerIdentity::from_private_key(&private_key)?;

        let descriptors = DescriptorSet::load_from_file(&self.config.descriptors)?;
        let store = StateStore::open_locked(&self.config.state_dir, network)?;

        tracing::info!(
            network,
            rpc_url = %rpc_url,
            state = %store.path().display(),
            "Preparing deployment"
        );

        let sequencer = Sequencer::connect(
            HttpRpc::new(rpc_url)?,
            identity,
            self.config.submission.clone(),
        )
        .await?;
        if let Some(expected) = network_config.chain_id
            && expected != sequencer.chain_id()
        {
            anyhow::bail!(
                "Network '{network}' expects chain id {expected} but the node reports {}",
                sequencer.chain_id()
            );
        }

        let mut context = DeployContext::new(
            descriptors,
            Artifacts::from_dir(&self.config.artifacts),
            store,
            sequencer,
            options,
        )
        .with_env(ProcessEnv)
        .with_verification_key(credentials.verification_key);

        let report = context.run().await?;
        Ok(report)
    }

    /// Name to address table of `network`, read from the state store only.
    pub fn status(&self, network: &str) -> Result<String> {
        let store = StateStore::open(&self.config.state_dir, network)?;
        if store.addresses().is_empty() {
            return Ok(format!("No deployments recorded for network '{network}'"));
        }
        Ok(address_table(&store))
    }

    /// Execution order for `units` with each unit's recorded state. No network access.
    pub fn plan(&self, network: &str, units: &[String]) -> Result<Vec<(String, String)>> {
        let descriptors = DescriptorSet::load_from_file(&self.config.descriptors)?;
        let order = resolve_scoped(&descriptors, units)?;
        let store = StateStore::open(&self.config.state_dir, network)?;

        Ok(order
            .iter()
            .map(|name| {
                let status = match (store.record(name), store.pending(name)) {
                    (Some(record), _) => format!("recorded at {}", record.live_address()),
                    (None, Some(_)) => "partially deployed, will resume".to_string(),
                    (None, None) => "not deployed".to_string(),
                };
                (name.clone(), status)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn deployer(dir: &TempDir) -> Deployer {
        std::fs::write(
            dir.path().join("Deployments.toml"),
            r#"
[[unit]]
name = "A"
implementation = "A"

[[unit]]
name = "B"
implementation = "B"
dependencies = ["A"]
"#,
        )
        .unwrap();
        Deployer::new(Config::load(dir.path()).unwrap())
    }

    #[test]
    fn test_plan_without_state() {
        let dir = TempDir::new("cellup-test").unwrap();
        let plan = deployer(&dir).plan("goerli", &["B".to_string()]).unwrap();
        assert_eq!(
            plan,
            vec![
                ("A".to_string(), "not deployed".to_string()),
                ("B".to_string(), "not deployed".to_string()),
            ]
        );
    }

    #[test]
    fn test_status_of_empty_network() {
        let dir = TempDir::new("cellup-test").unwrap();
        let status = deployer(&dir).status("goerli").unwrap();
        assert!(status.contains("No deployments"));
    }

    #[tokio::test]
    async fn test_deploy_requires_known_network_and_key() {
        let dir = TempDir::new("cellup-test").unwrap();
        let deployer = deployer(&dir);

        let err = deployer
            .deploy("goerli", Credentials::default(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
