//! Project configuration (`Cellup.toml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::descriptor::DESCRIPTORS_FILENAME;
use crate::sequencer::SubmissionPolicy;

/// The default name for the configuration file.
pub const CONFIG_FILENAME: &str = "Cellup.toml";

/// Connection settings of a named network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<Url>,
    /// When set, the node must report this chain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

/// Paths, networks and submission tuning. Holds no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub descriptors: PathBuf,
    pub artifacts: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub submission: SubmissionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptors: PathBuf::from(DESCRIPTORS_FILENAME),
            artifacts: PathBuf::from("build/artifacts"),
            state_dir: PathBuf::from("deployments"),
            networks: BTreeMap::new(),
            submission: SubmissionPolicy::default(),
        }
    }
}

impl Config {
    /// Load the configuration, layering defaults, the TOML file and `CELLUP_*`
    /// environment variables (`__` separates nested keys).
    ///
    /// `path` may be the file itself or the directory containing it. A missing
    /// file leaves the defaults in place. Relative paths are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let mut config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CELLUP_").split("__"))
            .extract()
            .context(format!("Failed to load config from {}", config_path.display()))?;

        let base = config_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.descriptors = base.join(&config.descriptors);
        config.artifacts = base.join(&config.artifacts);
        config.state_dir = base.join(&config.state_dir);

        tracing::debug!(
            path = %config_path.display(),
            networks = config.networks.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Settings for `name`; unknown networks are an error.
    pub fn network(&self, name: &str) -> Result<&NetworkConfig> {
        self.networks.get(name).with_context(|| {
            let known: Vec<&str> = self.networks.keys().map(String::as_str).collect();
            format!(
                "Network '{name}' is not configured (known: {})",
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_load_with_defaults_and_relative_paths() {
        let dir = TempDir::new("cellup-test").unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"
artifacts = "out"

[networks.goerli]
rpc_url = "https://goerli.example.org/"
chain_id = 5

[submission]
max_resubmissions = 5
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.artifacts, dir.path().join("out"));
        assert_eq!(config.descriptors, dir.path().join(DESCRIPTORS_FILENAME));
        assert_eq!(config.state_dir, dir.path().join("deployments"));

        let goerli = config.network("goerli").unwrap();
        assert_eq!(goerli.chain_id, Some(5));
        assert_eq!(
            goerli.rpc_url.as_ref().map(Url::as_str),
            Some("https://goerli.example.org/")
        );

        assert_eq!(config.submission.max_resubmissions, 5);
        assert_eq!(config.submission.fee_bump_percent, 20, "unset fields keep defaults");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new("cellup-test").unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.state_dir, dir.path().join("deployments"));
        assert!(config.networks.is_empty());
    }

    #[test]
    fn test_unknown_network() {
        let err = Config::default().network("mainnet").unwrap_err();
        assert!(err.to_string().contains("mainnet"));
    }
}
