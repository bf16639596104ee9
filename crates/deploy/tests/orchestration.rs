//! End-to-end orchestration tests for cellup-deploy.
//!
//! Each test drives the full pipeline (resolver, executor, wiring, sequencer and
//! state store) against the in-memory chain from the `test-support` feature, with
//! the state directory in a fresh temporary directory.
//! Run with: cargo test --test orchestration

use std::collections::HashMap;

use alloy_core::primitives::Address;
use cellup_deploy::test_support::{
    ANVIL_ADDRESS, ANVIL_KEY, CELL_DESCRIPTORS, MockChain, cell_artifacts, selector,
};
use cellup_deploy::{
    DeployContext, DeployError, DeployerIdentity, DescriptorSet, RunOptions, RunReport,
    Sequencer, StateStore, SubmissionPolicy, UnitOutcome, WiringOutcome,
};
use tempdir::TempDir;

const NETWORK: &str = "devnet";
const CHAIN_ID: u64 = 31337;

/// `C` depends on `A` and `B`; its address is registered into both.
const ABC: &str = r#"
[[unit]]
name = "A"
implementation = "CellIDRegistry"
skip_if_already_deployed = true
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = ["Alpha", "A"] }

[[unit]]
name = "B"
implementation = "CellNameSpace"
skip_if_already_deployed = true
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = ["Beta", "B"] }

[[unit]]
name = "C"
implementation = "ResolveController"
dependencies = ["A", "B"]
skip_if_already_deployed = true

[[wiring]]
target = "A"
method = "setController"
args = [{ address_of = "C" }]

[[wiring]]
target = "B"
method = "setController"
args = [{ address_of = "C" }]
"#;

/// Transactions of a clean `ABC` run: two proxied units (3 each), one direct, two wiring calls.
const ABC_TRANSACTIONS: usize = 9;

fn policy() -> SubmissionPolicy {
    SubmissionPolicy {
        confirmation_timeout_secs: 10,
        poll_interval_ms: 500,
        max_resubmissions: 1,
        fee_bump_percent: 20,
        send_retries: 2,
        retry_min_delay_ms: 10,
        gas_limit_multiplier_percent: 120,
    }
}

/// Test setup: a chain and a state directory shared by consecutive runs.
struct TestContext {
    dir: TempDir,
    chain: MockChain,
    env: HashMap<String, String>,
}

/// Initialize tracing for tests (idempotent).
fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

impl TestContext {
    fn new() -> Self {
        init_test_tracing();
        Self {
            dir: TempDir::new("cellup-test").unwrap(),
            chain: MockChain::new(CHAIN_ID),
            env: HashMap::new(),
        }
    }

    async fn context(&self, descriptors: &str, options: RunOptions) -> DeployContext<MockChain> {
        let store = StateStore::open_locked(self.dir.path(), NETWORK).unwrap();
        let identity = DeployerIdentity::from_private_key(ANVIL_KEY).unwrap();
        let sequencer = Sequencer::connect(self.chain.clone(), identity, policy())
            .await
            .unwrap();

        DeployContext::new(
            DescriptorSet::from_toml(descriptors).unwrap(),
            cell_artifacts(),
            store,
            sequencer,
            options,
        )
        .with_env(self.env.clone())
    }

    async fn try_run(&self, descriptors: &str, options: RunOptions) -> Result<RunReport, DeployError> {
        self.context(descriptors, options).await.run().await
    }

    async fn run(&self, descriptors: &str) -> RunReport {
        self.try_run(descriptors, RunOptions::default()).await.unwrap()
    }

    fn store(&self) -> StateStore {
        StateStore::open(self.dir.path(), NETWORK).unwrap()
    }

    fn address(&self, unit: &str) -> Address {
        self.store().live_address(unit).unwrap()
    }

    /// Mined calls to `target` with the given method signature.
    fn calls(&self, target: Address, signature: &str) -> usize {
        self.chain
            .calls_to(target)
            .iter()
            .filter(|data| data.get(..4) == Some(&selector(signature)[..]))
            .count()
    }
}

fn names(report: &RunReport) -> Vec<&str> {
    report.units.iter().map(|u| u.name.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_deploys_in_dependency_order() {
    let ctx = TestContext::new();
    let report = ctx.run(ABC).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(names(&report), vec!["A", "B", "C"]);
    for unit in &report.units {
        assert!(matches!(unit.outcome, UnitOutcome::Deployed { .. }), "{unit:?}");
    }
    assert_eq!(report.transactions as usize, ABC_TRANSACTIONS);
    assert_eq!(ctx.chain.mined().len(), ABC_TRANSACTIONS);

    let store = ctx.store();
    for name in ["A", "B", "C"] {
        let record = store.record(name).unwrap();
        assert!(record.initialized);
        assert!(ctx.chain.has_code(record.live_address()));
    }
    assert!(store.record("A").unwrap().proxy_address.is_some());
    assert!(store.record("C").unwrap().proxy_address.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_submits_nothing() {
    let ctx = TestContext::new();
    ctx.run(ABC).await;
    let before = ctx.store().addresses().into_iter().map(|(n, a)| (n.to_string(), a)).collect::<Vec<_>>();

    let report = ctx.run(ABC).await;

    assert!(report.succeeded());
    assert_eq!(report.transactions, 0);
    assert_eq!(ctx.chain.broadcast().len(), ABC_TRANSACTIONS);
    for unit in &report.units {
        assert!(matches!(unit.outcome, UnitOutcome::Skipped { .. }), "{unit:?}");
    }
    for wiring in &report.wiring {
        assert_eq!(wiring.outcome, WiringOutcome::Skipped);
    }

    let after = ctx.store().addresses().into_iter().map(|(n, a)| (n.to_string(), a)).collect::<Vec<_>>();
    assert_eq!(before, after);
}

#[tokio::test(start_paused = true)]
async fn test_dependent_address_wired_into_both_targets() {
    let ctx = TestContext::new();
    ctx.run(ABC).await;

    let store = ctx.store();
    let controller = ctx.address("C").to_string();
    for target in ["A", "B"] {
        let records: Vec<_> = store.state().units[target].wiring.values().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "setController");
        assert_eq!(records[0].args, vec![controller.clone()]);
        assert!(records[0].tx_reference.starts_with("0x"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cycle_aborts_before_any_transaction() {
    let ctx = TestContext::new();
    let cyclic = r#"
[[unit]]
name = "A"
implementation = "ResolveController"
dependencies = ["B"]

[[unit]]
name = "B"
implementation = "ResolveController"
dependencies = ["A"]
"#;

    match ctx.try_run(cyclic, RunOptions::default()).await {
        Err(DeployError::CyclicDependency { members }) => assert_eq!(members, vec!["A", "B"]),
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(ctx.chain.broadcast().is_empty());
    assert!(ctx.store().addresses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bad_arguments_abort_before_any_transaction() {
    let ctx = TestContext::new();
    let bad = r#"
[[unit]]
name = "Tag"
implementation = "PromptTag"
constructor_args = ["only one"]
"#;

    let err = ctx.try_run(bad, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, DeployError::Configuration(_)), "{err}");
    assert!(ctx.chain.broadcast().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_override_falls_back_to_deployer() {
    let ctx = TestContext::new();
    let options = RunOptions {
        units: vec!["SBTsFactory".to_string()],
        ..RunOptions::default()
    };
    let report = ctx.try_run(CELL_DESCRIPTORS, options).await.unwrap();
    assert!(report.succeeded(), "{}", report.render());

    let calls = ctx.chain.calls_to(ctx.address("SBTsFactory"));
    assert_eq!(calls.len(), 1);
    // initialize(address): the address sits in the low 20 bytes of the first word.
    assert_eq!(&calls[0][16..36], ANVIL_ADDRESS.as_slice());
}

#[tokio::test(start_paused = true)]
async fn test_present_override_used_verbatim() {
    let mut ctx = TestContext::new();
    let trust_signer = Address::repeat_byte(0x42);
    ctx.env
        .insert("TRUST_SIGNER_ADDRESS".to_string(), trust_signer.to_string());

    let options = RunOptions {
        units: vec!["SBTsFactory".to_string()],
        ..RunOptions::default()
    };
    ctx.try_run(CELL_DESCRIPTORS, options).await.unwrap();

    let calls = ctx.chain.calls_to(ctx.address("SBTsFactory"));
    assert_eq!(&calls[0][16..36], trust_signer.as_slice());
}

#[tokio::test(start_paused = true)]
async fn test_full_cell_deployment() {
    let ctx = TestContext::new();
    let report = ctx.run(CELL_DESCRIPTORS).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(
        names(&report),
        vec![
            "CellIDRegistry",
            "CellNameSpace",
            "ResolveController",
            "SBTsFactory",
            "PromptTag"
        ]
    );
    assert_eq!(report.wiring.len(), 3);
    assert!(
        report
            .wiring
            .iter()
            .all(|w| matches!(w.outcome, WiringOutcome::Executed { .. }))
    );

    let controller = ctx.address("ResolveController");
    assert_eq!(
        ctx.calls(controller, "initialize(address,address,address)"),
        1
    );
    assert_eq!(
        ctx.calls(ctx.address("CellIDRegistry"), "setController(address)"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_scoped_run_deploys_dependencies_only() {
    let ctx = TestContext::new();
    let options = RunOptions {
        units: vec!["ResolveController".to_string()],
        ..RunOptions::default()
    };
    let report = ctx.try_run(CELL_DESCRIPTORS, options).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.unit("SBTsFactory"), Some(&UnitOutcome::NotRequested));
    assert_eq!(report.unit("PromptTag"), Some(&UnitOutcome::NotRequested));
    assert!(matches!(
        report.unit("CellIDRegistry"),
        Some(UnitOutcome::Deployed { .. })
    ));
    assert!(ctx.store().record("SBTsFactory").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_wiring_at_most_once_across_interrupted_runs() {
    let ctx = TestContext::new();

    // Everything up to and including A.setController goes through, then the node goes away.
    ctx.chain.limit_sends(Some(8));
    let first = ctx.run(ABC).await;
    assert!(!first.succeeded());
    assert!(first.halted_by.is_some());
    assert!(matches!(first.wiring[0].outcome, WiringOutcome::Executed { .. }));
    assert!(matches!(first.wiring[1].outcome, WiringOutcome::Failed { .. }));

    ctx.chain.limit_sends(None);
    let second = ctx.run(ABC).await;
    assert!(second.succeeded(), "{}", second.render());
    assert_eq!(second.wiring[0].outcome, WiringOutcome::Skipped);
    assert!(matches!(second.wiring[1].outcome, WiringOutcome::Executed { .. }));
    assert_eq!(second.transactions, 1);

    let third = ctx.run(ABC).await;
    assert_eq!(third.transactions, 0);

    for target in ["A", "B"] {
        assert_eq!(ctx.calls(ctx.address(target), "setController(address)"), 1);
        assert_eq!(ctx.store().state().units[target].wiring.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_authorization_failure_halts_and_resumes() {
    let ctx = TestContext::new();
    ctx.chain.deny("initialize(string,string)");

    let first = ctx.run(ABC).await;
    match first.unit("A") {
        Some(UnitOutcome::Failed { reason }) => assert!(reason.contains("not authorized"), "{reason}"),
        other => panic!("expected A to fail, got {other:?}"),
    }
    assert_eq!(first.unit("B"), Some(&UnitOutcome::NotAttempted));
    assert_eq!(first.unit("C"), Some(&UnitOutcome::NotAttempted));

    // Implementation and proxy are on chain, the initializer is not.
    assert_eq!(ctx.chain.mined().len(), 2);
    let store = ctx.store();
    assert!(store.record("A").is_none());
    let pending = store.pending("A").cloned().unwrap();
    assert!(pending.implementation.is_some() && pending.proxy.is_some());

    ctx.chain.allow("initialize(string,string)");
    let second = ctx.run(ABC).await;
    assert!(second.succeeded(), "{}", second.render());

    // Only the missing initializer was sent for A.
    assert_eq!(ctx.chain.mined().len(), ABC_TRANSACTIONS);
    let record = ctx.store().record("A").cloned().unwrap();
    assert_eq!(Some(record.address), pending.implementation);
    assert_eq!(record.proxy_address, pending.proxy);
    assert!(ctx.store().pending("A").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_remote_already_initialized_counts_as_success() {
    let ctx = TestContext::new();
    ctx.chain.deny("initialize(string,string)");
    ctx.run(ABC).await;

    let proxy = ctx.store().pending("A").and_then(|p| p.proxy).unwrap();
    ctx.chain.mark_applied(proxy, "initialize(string,string)");
    ctx.chain.allow("initialize(string,string)");

    let report = ctx.run(ABC).await;
    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(ctx.calls(proxy, "initialize(string,string)"), 0);
    assert!(ctx.store().record("A").unwrap().initialized);
    assert_eq!(ctx.chain.mined().len(), ABC_TRANSACTIONS - 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_going_blocks_only_dependents() {
    let descriptors = r#"
[[unit]]
name = "A"
implementation = "CellIDRegistry"
[unit.proxy]
owner = { account = "deployer" }
kind = "OptimizedTransparentProxy"
initializer = { method = "initialize", args = ["Alpha", "A"] }

[[unit]]
name = "C"
implementation = "ResolveController"
dependencies = ["A"]

[[unit]]
name = "D"
implementation = "PromptTag"
constructor_args = ["Delta", "D"]
"#;

    let halting = TestContext::new();
    halting.chain.deny("initialize(string,string)");
    let report = halting.run(descriptors).await;
    assert_eq!(report.unit("C"), Some(&UnitOutcome::NotAttempted));
    assert_eq!(report.unit("D"), Some(&UnitOutcome::NotAttempted));

    let ctx = TestContext::new();
    ctx.chain.deny("initialize(string,string)");
    let options = RunOptions {
        keep_going: true,
        ..RunOptions::default()
    };
    let report = ctx.try_run(descriptors, options).await.unwrap();

    assert!(!report.succeeded());
    assert!(report.halted_by.is_none());
    assert!(matches!(report.unit("A"), Some(UnitOutcome::Failed { .. })));
    assert_eq!(
        report.unit("C"),
        Some(&UnitOutcome::Blocked {
            dependency: "A".to_string()
        })
    );
    assert!(matches!(report.unit("D"), Some(UnitOutcome::Deployed { .. })));
    assert_eq!(report.failures().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_changed_configuration_needs_force() {
    let ctx = TestContext::new();
    ctx.run(ABC).await;
    let old_a = ctx.address("A");
    let mined = ctx.chain.mined().len();

    let renamed = ABC.replace(r#"["Alpha", "A"]"#, r#"["Alpha 2", "A2"]"#);

    // Pinned: the flag keeps the existing deployment.
    let pinned = ctx.run(&renamed).await;
    assert_eq!(pinned.unit("A"), Some(&UnitOutcome::Pinned { address: old_a }));
    assert_eq!(ctx.chain.mined().len(), mined);

    // Without the flag the drift is an error.
    let strict = renamed.replacen(
        "skip_if_already_deployed = true",
        "skip_if_already_deployed = false",
        1,
    );
    let failed = ctx.run(&strict).await;
    assert!(matches!(failed.unit("A"), Some(UnitOutcome::Failed { .. })));
    assert_eq!(ctx.chain.mined().len(), mined);

    // Forced: A is redeployed and re-wired, C is untouched.
    let options = RunOptions {
        force: true,
        ..RunOptions::default()
    };
    let forced = ctx.try_run(&strict, options).await.unwrap();
    assert!(forced.succeeded(), "{}", forced.render());
    let new_a = ctx.address("A");
    assert_ne!(new_a, old_a);
    assert!(matches!(forced.unit("C"), Some(UnitOutcome::Skipped { .. })));
    assert_eq!(ctx.calls(new_a, "setController(address)"), 1);
    assert_eq!(forced.transactions, 4);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout_halts_and_rerun_recovers() {
    let ctx = TestContext::new();
    ctx.chain.stall_next_sends(2);

    let first = ctx.run(ABC).await;
    match first.unit("A") {
        Some(UnitOutcome::Failed { reason }) => assert!(reason.contains("not confirmed"), "{reason}"),
        other => panic!("expected A to time out, got {other:?}"),
    }
    assert!(first.halted_by.is_some());
    assert_eq!(ctx.chain.broadcast().len(), 2);
    let pending = ctx.store().pending("A").cloned().unwrap();
    assert_eq!(pending.broadcast["implementation"].len(), 2);

    // The network catches up between runs.
    ctx.chain.release_stalled();
    let second = ctx.run(ABC).await;
    assert!(second.succeeded(), "{}", second.render());

    // The implementation that landed late is reused, not deployed a second time.
    assert_eq!(ctx.chain.mined().len(), ABC_TRANSACTIONS);
    let landed = ctx.chain.mined()[0].clone();
    let record = ctx.store().record("A").cloned().unwrap();
    assert_eq!(record.address, landed.from.create(landed.nonce));
    assert!(ctx.store().pending("A").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_wiring_that_lands_after_timeout_not_repeated() {
    let ctx = TestContext::new();
    // All seven unit transactions mine, then both attempts of A.setController stall.
    ctx.chain.stall_sends_after(7, 2);

    let first = ctx.run(ABC).await;
    assert!(first.halted_by.is_some());
    match &first.wiring[0].outcome {
        WiringOutcome::Failed { reason } => assert!(reason.contains("not confirmed"), "{reason}"),
        other => panic!("expected A.setController to time out, got {other:?}"),
    }
    assert_eq!(ctx.chain.mined().len(), 7);

    ctx.chain.release_stalled();
    let second = ctx.run(ABC).await;
    assert!(second.succeeded(), "{}", second.render());
    assert!(matches!(second.wiring[0].outcome, WiringOutcome::Executed { .. }));
    assert_eq!(second.transactions, 1);

    assert_eq!(ctx.chain.mined().len(), ABC_TRANSACTIONS);
    for target in ["A", "B"] {
        assert_eq!(ctx.calls(ctx.address(target), "setController(address)"), 1);
    }
    assert!(ctx.store().state().units["A"].wiring_broadcast.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_state_bound_to_chain() {
    let ctx = TestContext::new();
    ctx.run(ABC).await;

    let other = TestContext {
        dir: ctx.dir,
        chain: MockChain::new(5),
        env: HashMap::new(),
    };
    let err = other.try_run(ABC, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, DeployError::Configuration(_)), "{err}");
    assert!(other.chain.broadcast().is_empty());
}
