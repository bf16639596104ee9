//! Per-network persisted deployment state.
//!
//! One pretty-printed JSON file per network (`<state_dir>/<network>.json`) holds,
//! keyed by unit name, the unit's [`DeploymentRecord`], an optional resume
//! checkpoint and the [`WiringRecord`]s of actions targeting the unit. Every
//! mutation is written through immediately so an interrupted run leaves a state
//! the next run can resume from.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// A unit that was fully deployed (and initialized, when proxied) on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    pub network: String,
    /// Implementation address.
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<Address>,
    pub argument_fingerprint: String,
    pub initialized: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentRecord {
    /// The address other units interact with.
    pub fn live_address(&self) -> Address {
        self.proxy_address.unwrap_or(self.address)
    }
}

/// A wiring action confirmed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringRecord {
    pub idempotency_key: String,
    pub method: String,
    pub args: Vec<String>,
    pub executed_at: DateTime<Utc>,
    /// Transaction hash, or [`REMOTE_GUARD_REFERENCE`] when the target reported the
    /// call as already applied.
    pub tx_reference: String,
}

/// Reference stored when a call was answered by the remote single-initialization guard.
pub const REMOTE_GUARD_REFERENCE: &str = "already-initialized";

/// Steps of an unfinished deployment, confirmed on chain but not yet complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeployment {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Address>,
    /// Creation transactions broadcast but never seen confirmed, keyed by step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub broadcast: BTreeMap<String, Vec<B256>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<DeploymentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingDeployment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wiring: BTreeMap<String, WiringRecord>,
    /// Wiring transactions broadcast but never seen confirmed, keyed by idempotency key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wiring_broadcast: BTreeMap<String, Vec<B256>>,
}

/// Serialized content of a network state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub units: BTreeMap<String, UnitEntry>,
}

/// Handle on a network's state file.
///
/// Opened with [`StateStore::open_locked`] it also holds the run lock for the
/// network until dropped.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: NetworkState,
    _lock: Option<File>,
}

impl StateStore {
    /// Open the state for reading, without taking the run lock.
    pub fn open(state_dir: &Path, network: &str) -> Result<Self> {
        let path = state_path(state_dir, network)?;
        let state = load(&path, network)?;
        Ok(Self {
            path,
            state,
            _lock: None,
        })
    }

    /// Open the state for a deployment run, taking the exclusive network lock.
    pub fn open_locked(state_dir: &Path, network: &str) -> Result<Self> {
        let path = state_path(state_dir, network)?;
        std::fs::create_dir_all(state_dir).map_err(|source| DeployError::StateStore {
            path: state_dir.to_path_buf(),
            source,
        })?;

        let lock_path = state_dir.join(format!("{network}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| DeployError::StateStore {
                path: lock_path.clone(),
                source,
            })?;
        FileExt::try_lock_exclusive(&lock).map_err(|_| DeployError::Locked {
            path: lock_path.clone(),
        })?;
        tracing::debug!(lock = %lock_path.display(), "Acquired network lock");

        let state = load(&path, network)?;
        Ok(Self {
            path,
            state,
            _lock: Some(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn network(&self) -> &str {
        &self.state.network
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    /// Pin the state file to a chain, refusing to mix chains under one network name.
    pub fn bind_chain(&mut self, chain_id: u64) -> Result<()> {
        match self.state.chain_id {
            Some(stored) if stored != chain_id => Err(DeployError::config(format!(
                "state for network '{}' was recorded on chain {stored}, but the RPC endpoint serves chain {chain_id}",
                self.state.network
            ))),
            Some(_) => Ok(()),
            None => {
                self.state.chain_id = Some(chain_id);
                self.persist()
            }
        }
    }

    pub fn record(&self, name: &str) -> Option<&DeploymentRecord> {
        self.state.units.get(name)?.record.as_ref()
    }

    /// Live address of an initialized unit.
    pub fn live_address(&self, name: &str) -> Option<Address> {
        self.record(name)
            .filter(|record| record.initialized)
            .map(DeploymentRecord::live_address)
    }

    pub fn pending(&self, name: &str) -> Option<&PendingDeployment> {
        self.state.units.get(name)?.pending.as_ref()
    }

    pub fn set_pending(&mut self, name: &str, pending: PendingDeployment) -> Result<()> {
        self.unit_mut(name).pending = Some(pending);
        self.persist()
    }

    /// Store a completed deployment, replacing any previous record and checkpoint.
    pub fn put_record(&mut self, record: DeploymentRecord) -> Result<()> {
        let unit = self.unit_mut(&record.name);
        unit.pending = None;
        unit.record = Some(record);
        self.persist()
    }

    pub fn wiring_record(&self, target: &str, key: &str) -> Option<&WiringRecord> {
        self.state.units.get(target)?.wiring.get(key)
    }

    /// Store a completed wiring action, clearing its in-flight hashes.
    pub fn put_wiring(&mut self, target: &str, record: WiringRecord) -> Result<()> {
        let unit = self.unit_mut(target);
        unit.wiring_broadcast.remove(&record.idempotency_key);
        unit.wiring.insert(record.idempotency_key.clone(), record);
        self.persist()
    }

    pub fn wiring_broadcast(&self, target: &str, key: &str) -> Option<&[B256]> {
        self.state
            .units
            .get(target)?
            .wiring_broadcast
            .get(key)
            .map(Vec::as_slice)
    }

    /// Remember the hashes of a wiring call before waiting for it to confirm.
    pub fn set_wiring_broadcast(&mut self, target: &str, key: &str, hashes: Vec<B256>) -> Result<()> {
        self.unit_mut(target)
            .wiring_broadcast
            .insert(key.to_string(), hashes);
        self.persist()
    }

    /// Recorded units with their live address, sorted by name.
    pub fn addresses(&self) -> Vec<(&str, Address)> {
        self.state
            .units
            .iter()
            .filter_map(|(name, unit)| {
                unit.record
                    .as_ref()
                    .map(|record| (name.as_str(), record.live_address()))
            })
            .collect()
    }

    fn unit_mut(&mut self, name: &str) -> &mut UnitEntry {
        self.state.units.entry(name.to_string()).or_default()
    }

    /// Write the state through a synced temporary file so a crash never truncates it.
    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state).map_err(|source| {
            DeployError::StateCorrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        write_synced(&tmp, format!("{json}\n").as_bytes()).map_err(|source| {
            DeployError::StateStore {
                path: tmp.clone(),
                source,
            }
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| DeployError::StateStore {
            path: self.path.clone(),
            source,
        })?;

        tracing::trace!(path = %self.path.display(), "State persisted");
        Ok(())
    }
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

fn state_path(state_dir: &Path, network: &str) -> Result<PathBuf> {
    let valid = !network.is_empty()
        && network
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(DeployError::config(format!(
            "invalid network name '{network}': use letters, digits, '-' and '_'"
        )));
    }
    Ok(state_dir.join(format!("{network}.json")))
}

fn load(path: &Path, network: &str) -> Result<NetworkState> {
    if !path.exists() {
        return Ok(NetworkState {
            network: network.to_string(),
            ..Default::default()
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| DeployError::StateStore {
        path: path.to_path_buf(),
        source,
    })?;
    let state: NetworkState =
        serde_json::from_str(&content).map_err(|source| DeployError::StateCorrupt {
            path: path.to_path_buf(),
            source,
        })?;

    if state.network != network {
        return Err(DeployError::config(format!(
            "state file {} belongs to network '{}'",
            path.display(),
            state.network
        )));
    }
    Ok(state)
}
