#![allow(dead_code)]

use bloomnet::orchestrator::{ReplicationMember, ReplicationTool, ToolError};
use bloomnet::persistence::{InMemoryLedger, LedgerError, LedgerSnapshot, LedgerStore, LedgerTxn};
use bloomnet::registry::{HealthProbe, NodeRegistry, ProbeError};
use bloomnet::targets::RefreshSignal;
use bloomnet::telemetry::MetricsRegistry;
use bloomnet::{ClusterOrchestrator, RetryPolicy};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

/// Probe whose answer is scripted per address; unknown addresses are healthy.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashMap<String, bool>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn set_down(&self, address: &str, down: bool) {
        self.down.lock().unwrap().insert(address.to_string(), down);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe(&self, address: &str, port: u16) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let down = self
            .down
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(false);
        if down {
            Err(ProbeError::Timeout {
                endpoint: format!("{address}:{port}"),
                timeout: Duration::from_millis(1),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct Gate {
    armed: bool,
    entered: bool,
    released: bool,
}

/// Replication tool returning scripted outcomes in order, then success.
/// When gated, each call blocks until [`ScriptedTool::release`].
#[derive(Default)]
pub struct ScriptedTool {
    outcomes: Mutex<VecDeque<Result<(), ToolError>>>,
    calls: Mutex<Vec<(String, Vec<ReplicationMember>)>>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl ScriptedTool {
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), ToolError>>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn always(&self, outcome: Result<(), ToolError>, times: usize) {
        self.script(std::iter::repeat(outcome).take(times));
    }

    pub fn calls(&self) -> Vec<(String, Vec<ReplicationMember>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn arm_gate(&self) {
        self.gate.lock().unwrap().armed = true;
    }

    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let gate = self.gate.lock().unwrap();
        let (gate, _) = self
            .gate_changed
            .wait_timeout_while(gate, timeout, |gate| !gate.entered)
            .unwrap();
        gate.entered
    }

    pub fn release(&self) {
        self.gate.lock().unwrap().released = true;
        self.gate_changed.notify_all();
    }
}

impl ReplicationTool for ScriptedTool {
    fn apply_replication(
        &self,
        cluster: &str,
        members: &[ReplicationMember],
    ) -> Result<(), ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((cluster.to_string(), members.to_vec()));
        let mut gate = self.gate.lock().unwrap();
        if gate.armed {
            gate.entered = true;
            self.gate_changed.notify_all();
            while !gate.released {
                gate = self.gate_changed.wait(gate).unwrap();
            }
        }
        drop(gate);
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// In-memory ledger whose commits can be made to fail with an I/O error.
#[derive(Default)]
pub struct FlakyLedger {
    inner: InMemoryLedger,
    fail_commits: AtomicBool,
}

impl FlakyLedger {
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl LedgerStore for FlakyLedger {
    fn snapshot(&self) -> Result<Arc<LedgerSnapshot>, LedgerError> {
        self.inner.snapshot()
    }

    fn commit(&self, txn: LedgerTxn) -> Result<u64, LedgerError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(LedgerError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated disk failure",
            )));
        }
        self.inner.commit(txn)
    }
}

pub struct Harness {
    pub ledger: Arc<dyn LedgerStore>,
    pub probe: Arc<ScriptedProbe>,
    pub tool: Arc<ScriptedTool>,
    pub signal: RefreshSignal,
    pub metrics: MetricsRegistry,
    pub registry: Arc<NodeRegistry>,
    pub orchestrator: Arc<ClusterOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_ledger(Arc::new(InMemoryLedger::new()))
    }

    pub fn with_ledger(ledger: Arc<dyn LedgerStore>) -> Self {
        let probe = Arc::new(ScriptedProbe::default());
        let tool = Arc::new(ScriptedTool::default());
        let signal = RefreshSignal::new();
        let metrics = MetricsRegistry::default();
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&ledger),
            probe.clone(),
            signal.clone(),
            metrics.clone(),
        ));
        let orchestrator = Arc::new(ClusterOrchestrator::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            tool.clone(),
            RetryPolicy::exponential(3, Duration::ZERO),
            metrics.clone(),
        ));
        Self {
            ledger,
            probe,
            tool,
            signal,
            metrics,
            registry,
            orchestrator,
        }
    }

    /// Registers `name` at 100.64.0.<octet>:9000 and returns its address.
    pub fn register(&self, name: &str, octet: u8) -> String {
        let address = format!("100.64.0.{octet}");
        self.registry
            .register_node(name, &address, 9000, now())
            .expect("register node");
        address
    }
}

pub fn now() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
