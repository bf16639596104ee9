//! In-memory chain and fixtures for exercising the orchestrator without a node.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy_core::primitives::{Address, B256, Bytes, keccak256};

use crate::artifact::{Artifact, Artifacts};
use crate::rpc::{CallRequest, ChainError, ChainRpc, Receipt};
use crate::signer::SignedTransaction;

/// Private key of the first default Anvil/Hardhat account.
pub const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Address of [`ANVIL_KEY`].
pub const ANVIL_ADDRESS: Address =
    alloy_core::primitives::address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

const BASE_GAS_PRICE: u128 = 1_000_000_000;

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[derive(Default)]
struct ChainState {
    nonces: HashMap<Address, u64>,
    code: HashMap<Address, Bytes>,
    receipts: HashMap<B256, Receipt>,
    /// Broadcast but never mined, keyed by hash.
    stalled: HashMap<B256, SignedTransaction>,
    broadcast: Vec<SignedTransaction>,
    mined: Vec<SignedTransaction>,
    /// Selectors that revert once applied to a given target.
    guarded: HashSet<[u8; 4]>,
    applied: HashSet<(Address, [u8; 4])>,
    denied: HashSet<[u8; 4]>,
    fail_sends: u32,
    fail_receipts: u32,
    /// Broadcasts to mine normally before stalling starts.
    stall_after: u32,
    stall_sends: u32,
    send_budget: Option<u32>,
    block: u64,
}

/// A single-account chain that mines every accepted transaction immediately.
///
/// Clones share state, so a test can keep a handle while the orchestrator owns another.
#[derive(Clone)]
pub struct MockChain {
    chain_id: u64,
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        let state = ChainState {
            guarded: ["initialize(string,string)", "initialize(address)", "initialize(address,address,address)"]
                .into_iter()
                .map(selector)
                .collect(),
            ..ChainState::default()
        };
        Self {
            chain_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` broadcasts with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state().fail_sends = count;
    }

    /// Accept the next `count` broadcasts without ever mining them.
    pub fn stall_next_sends(&self, count: u32) {
        self.stall_sends_after(0, count);
    }

    /// Mine `skip` more broadcasts, then accept `count` without mining them.
    pub fn stall_sends_after(&self, skip: u32, count: u32) {
        let mut state = self.state();
        state.stall_after = skip;
        state.stall_sends = count;
    }

    /// Answer the next `count` receipt queries with a non-transient RPC error.
    pub fn fail_next_receipts(&self, count: u32) {
        self.state().fail_receipts = count;
    }

    /// Accept only `count` more broadcasts; later ones fail with a transport error.
    /// `None` lifts the limit.
    pub fn limit_sends(&self, count: Option<u32>) {
        self.state().send_budget = count;
    }

    /// Make calls to `signature` revert as unauthorized.
    pub fn deny(&self, signature: &str) {
        self.state().denied.insert(selector(signature));
    }

    pub fn allow(&self, signature: &str) {
        self.state().denied.remove(&selector(signature));
    }

    /// Record a guarded call as already applied on `target`.
    pub fn mark_applied(&self, target: Address, signature: &str) {
        self.state().applied.insert((target, selector(signature)));
    }

    /// Mine the best-paying stalled transaction of each nonce.
    pub fn release_stalled(&self) {
        let mut state = self.state();
        let mut stalled: Vec<SignedTransaction> = state.stalled.values().cloned().collect();
        stalled.sort_by_key(|tx| (tx.nonce, std::cmp::Reverse(tx.gas_price)));
        stalled.dedup_by_key(|tx| tx.nonce);
        for tx in stalled {
            state.mine(tx);
        }
    }

    pub fn has_code(&self, address: Address) -> bool {
        self.state().code.contains_key(&address)
    }

    /// Every accepted broadcast, replacements included.
    pub fn broadcast(&self) -> Vec<SignedTransaction> {
        self.state().broadcast.clone()
    }

    pub fn mined(&self) -> Vec<SignedTransaction> {
        self.state().mined.clone()
    }

    /// Call data of every mined transaction sent to `target`.
    pub fn calls_to(&self, target: Address) -> Vec<Bytes> {
        self.state()
            .mined
            .iter()
            .filter(|tx| tx.to == Some(target))
            .map(|tx| tx.data.clone())
            .collect()
    }
}

impl ChainState {
    fn simulate(&self, to: Option<Address>, data: &[u8]) -> Result<(), ChainError> {
        let (Some(to), Some(prefix)) = (to, data.get(..4)) else {
            return Ok(());
        };
        let selector = [prefix[0], prefix[1], prefix[2], prefix[3]];

        if self.denied.contains(&selector) {
            return Err(ChainError::Reverted {
                reason: "Ownable: caller is not the owner".to_string(),
                data: None,
            });
        }
        if self.guarded.contains(&selector) && self.applied.contains(&(to, selector)) {
            return Err(ChainError::Reverted {
                reason: "Initializable: contract is already initialized".to_string(),
                data: None,
            });
        }
        Ok(())
    }

    fn mine(&mut self, tx: SignedTransaction) -> B256 {
        self.stalled
            .retain(|_, pending| !(pending.from == tx.from && pending.nonce == tx.nonce));
        self.nonces.insert(tx.from, tx.nonce + 1);
        self.block += 1;

        let success = self.simulate(tx.to, &tx.data).is_ok();
        let mut contract_address = None;
        if success {
            match tx.to {
                None => {
                    let address = tx.from.create(tx.nonce);
                    self.code.insert(address, tx.data.clone());
                    contract_address = Some(address);
                }
                Some(to) => {
                    if let Some(prefix) = tx.data.get(..4) {
                        let selector = [prefix[0], prefix[1], prefix[2], prefix[3]];
                        if self.guarded.contains(&selector) {
                            self.applied.insert((to, selector));
                        }
                    }
                }
            }
        }

        self.receipts.insert(
            tx.hash,
            Receipt {
                transaction_hash: tx.hash,
                success,
                contract_address,
                block_number: Some(self.block),
            },
        );
        let hash = tx.hash;
        self.mined.push(tx);
        hash
    }
}

impl ChainRpc for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self.state().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(BASE_GAS_PRICE)
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        self.state().simulate(call.to, &call.data).map(|()| 100_000)
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, ChainError> {
        self.state().simulate(call.to, &call.data).map(|()| Bytes::new())
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<B256, ChainError> {
        let mut state = self.state();

        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(ChainError::Transport("connection reset by peer".to_string()));
        }
        match state.send_budget {
            Some(0) => return Err(ChainError::Transport("connection refused".to_string())),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }

        let expected = state.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce < expected {
            return Err(ChainError::NonceTooLow);
        }
        if tx.nonce > expected {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "nonce too high".to_string(),
            });
        }
        if state.stalled.contains_key(&tx.hash) {
            return Err(ChainError::AlreadyKnown);
        }
        let highest_pending = state
            .stalled
            .values()
            .filter(|pending| pending.from == tx.from && pending.nonce == tx.nonce)
            .map(|pending| pending.gas_price)
            .max();
        if let Some(price) = highest_pending
            && tx.gas_price < price * 110 / 100
        {
            return Err(ChainError::Underpriced);
        }

        state.broadcast.push(tx.clone());
        if state.stall_after > 0 {
            state.stall_after -= 1;
        } else if state.stall_sends > 0 {
            state.stall_sends -= 1;
            state.stalled.insert(tx.hash, tx.clone());
            return Ok(tx.hash);
        }
        Ok(state.mine(tx.clone()))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, ChainError> {
        let mut state = self.state();
        if state.fail_receipts > 0 {
            state.fail_receipts -= 1;
            return Err(ChainError::Rpc {
                code: -32603,
                message: "internal error".to_string(),
            });
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }
}

/// Creation bytecode that differs per contract name.
fn bytecode(name: &str) -> Bytes {
    let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52];
    code.extend_from_slice(name.as_bytes());
    code.into()
}

/// Artifacts for the cell contracts and their proxy.
pub fn cell_artifacts() -> Artifacts {
    let contracts: [(&str, &[&str]); 6] = [
        (
            "OptimizedTransparentProxy",
            &["constructor(address logic, address admin, bytes data)"],
        ),
        (
            "CellIDRegistry",
            &[
                "function initialize(string name, string symbol)",
                "function setController(address controller)",
            ],
        ),
        (
            "CellNameSpace",
            &[
                "function initialize(string name, string symbol)",
                "function setController(address controller)",
            ],
        ),
        (
            "ResolveController",
            &["function initialize(address registry, address namespace, address trustSigner)"],
        ),
        (
            "SBTsFactory",
            &[
                "function initialize(address trustSigner)",
                "function setController(address controller)",
            ],
        ),
        ("PromptTag", &["constructor(string name, string symbol)"]),
    ];

    contracts
        .into_iter()
        .fold(Artifacts::default(), |artifacts, (name, signatures)| {
            let artifact = Artifact::from_signatures(name, signatures, bytecode(name))
                .unwrap_or_else(|e| panic!("fixture artifact {name}: {e}"));
            artifacts.with_artifact(artifact)
        })
}

/// Descriptors for the cell contracts.
pub const CELL_DESCRIPTORS: &str = r#"
[[unit]]
name = "CellIDRegistry"
implementation = "CellIDRegistry"
skip_if_already_deployed = true
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = ["Cell ID", "CELLID"] }

[[unit]]
name = "CellNameSpace"
implementation = "CellNameSpace"
skip_if_already_deployed = true
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = ["Cell Name Space", "CELLNS"] }

[[unit]]
name = "ResolveController"
implementation = "ResolveController"
dependencies = ["CellIDRegistry", "CellNameSpace"]
skip_if_already_deployed = true

[[unit]]
name = "SBTsFactory"
implementation = "SBTsFactory"
skip_if_already_deployed = true
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = [{ env = "TRUST_SIGNER_ADDRESS" }] }

[[unit]]
name = "PromptTag"
implementation = "PromptTag"
constructor_args = ["Prompt Tag", "PTAG"]
skip_if_already_deployed = true

[[wiring]]
target = "ResolveController"
method = "initialize"
args = [
    { address_of = "CellIDRegistry" },
    { address_of = "CellNameSpace" },
    { env = "TRUST_SIGNER_ADDRESS" },
]

[[wiring]]
target = "CellIDRegistry"
method = "setController"
args = [{ address_of = "ResolveController" }]

[[wiring]]
target = "CellNameSpace"
method = "setController"
args = [{ address_of = "ResolveController" }]
"#;
