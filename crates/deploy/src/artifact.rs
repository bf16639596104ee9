//! Compiled contract artifacts and ABI encoding of resolved arguments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use alloy_core::dyn_abi::{DynSolValue, JsonAbiExt, Specifier};
use alloy_core::json_abi::{Function, JsonAbi, Param};
use alloy_core::primitives::Bytes;
use serde::Deserialize;

use crate::error::{DeployError, Result};

/// A contract's interface and creation bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: JsonAbi,
    bytecode: RawBytecode,
}

/// Hardhat stores bytecode as a hex string, Foundry wraps it in `{ "object": ... }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

impl RawBytecode {
    fn into_hex(self) -> String {
        match self {
            RawBytecode::Hex(hex) | RawBytecode::Object { object: hex } => hex,
        }
    }
}

impl Artifact {
    /// Build an artifact from human-readable ABI signatures.
    pub fn from_signatures(name: &str, signatures: &[&str], bytecode: Bytes) -> Result<Self> {
        let abi = JsonAbi::parse(signatures.iter().copied())
            .map_err(|e| DeployError::config(format!("invalid ABI for '{name}': {e}")))?;
        Ok(Self {
            name: name.to_string(),
            abi,
            bytecode,
        })
    }

    pub fn from_json(name: &str, content: &str) -> Result<Self> {
        let raw: RawArtifact = serde_json::from_str(content)
            .map_err(|e| DeployError::config(format!("malformed artifact '{name}': {e}")))?;
        let hex = raw.bytecode.into_hex();

        if hex.contains("__$") {
            return Err(DeployError::config(format!(
                "artifact '{name}' has unlinked library references"
            )));
        }
        let bytecode = Bytes::from_str(&hex)
            .map_err(|e| DeployError::config(format!("artifact '{name}' bytecode: {e}")))?;
        if bytecode.is_empty() {
            return Err(DeployError::config(format!(
                "artifact '{name}' has no creation bytecode"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            abi: raw.abi,
            bytecode,
        })
    }

    pub fn constructor_arity(&self) -> usize {
        self.abi
            .constructor
            .as_ref()
            .map_or(0, |constructor| constructor.inputs.len())
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn deploy_data(&self, args: &[String]) -> Result<Bytes> {
        let mut data = self.bytecode.to_vec();
        match &self.abi.constructor {
            Some(constructor) => {
                let values = coerce(&self.name, "constructor", &constructor.inputs, args)?;
                let encoded = constructor.abi_encode_input(&values).map_err(|e| {
                    DeployError::config(format!("{}.constructor: {e}", self.name))
                })?;
                data.extend_from_slice(&encoded);
            }
            None if !args.is_empty() => {
                return Err(DeployError::config(format!(
                    "'{}' has no constructor but {} arguments were given",
                    self.name,
                    args.len()
                )));
            }
            None => {}
        }
        Ok(data.into())
    }

    /// Check that `method` exists with `arity` inputs.
    pub fn check_method(&self, method: &str, arity: usize) -> Result<()> {
        self.function(method, arity).map(|_| ())
    }

    /// Selector-prefixed call data for `method`.
    pub fn call_data(&self, method: &str, args: &[String]) -> Result<Bytes> {
        let function = self.function(method, args.len())?;
        let values = coerce(&self.name, method, &function.inputs, args)?;
        let encoded = function
            .abi_encode_input(&values)
            .map_err(|e| DeployError::config(format!("{}.{method}: {e}", self.name)))?;
        Ok(encoded.into())
    }

    fn function(&self, method: &str, arity: usize) -> Result<&Function> {
        self.abi
            .functions
            .get(method)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
            .ok_or_else(|| {
                DeployError::config(format!(
                    "'{}' has no method {method} taking {arity} arguments",
                    self.name
                ))
            })
    }
}

fn coerce(contract: &str, method: &str, params: &[Param], args: &[String]) -> Result<Vec<DynSolValue>> {
    if params.len() != args.len() {
        return Err(DeployError::config(format!(
            "{contract}.{method} expects {} arguments, got {}",
            params.len(),
            args.len()
        )));
    }

    params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            let ty = param.resolve().map_err(|e| {
                DeployError::config(format!("{contract}.{method}: parameter '{}': {e}", param.name))
            })?;
            ty.coerce_str(arg).map_err(|e| {
                DeployError::config(format!(
                    "{contract}.{method}: cannot use '{arg}' as {}: {e}",
                    param.ty
                ))
            })
        })
        .collect()
}

/// Artifact lookup by contract name, cached per run.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    dir: Option<PathBuf>,
    loaded: HashMap<String, Arc<Artifact>>,
}

impl Artifacts {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            loaded: HashMap::new(),
        }
    }

    /// Register an artifact directly, bypassing the filesystem.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.loaded
            .insert(artifact.name.clone(), Arc::new(artifact));
        self
    }

    /// Return the artifact for `name`, reading it on first use.
    pub fn load(&mut self, name: &str) -> Result<Arc<Artifact>> {
        if let Some(artifact) = self.loaded.get(name) {
            return Ok(Arc::clone(artifact));
        }

        let Some(dir) = &self.dir else {
            return Err(DeployError::config(format!("no artifact for '{name}'")));
        };
        let path = find_artifact(dir, name)
            .ok_or_else(|| DeployError::config(format!("no artifact for '{name}' under {}", dir.display())))?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            DeployError::config(format!("failed to read artifact {}: {e}", path.display()))
        })?;

        let artifact = Arc::new(Artifact::from_json(name, &content)?);
        tracing::debug!(contract = name, path = %path.display(), "Loaded artifact");
        self.loaded.insert(name.to_string(), Arc::clone(&artifact));
        Ok(artifact)
    }
}

/// Look for `<name>.json` directly under `dir`, then in Foundry's `<name>.sol/` layout,
/// then one directory deep.
fn find_artifact(dir: &Path, name: &str) -> Option<PathBuf> {
    let file = format!("{name}.json");

    [dir.join(&file), dir.join(format!("{name}.sol")).join(&file)]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .or_else(|| {
            std::fs::read_dir(dir)
                .ok()?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path().join(&file))
                .find(|candidate| candidate.is_file())
        })
}
