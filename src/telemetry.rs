//! In-process counters and gauges for the control plane.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const METRICS_NAMESPACE: &str = "bloomnet";

#[derive(Debug, Default)]
struct MetricsState {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
}

/// Cheaply cloneable handle; all clones share the same values.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    namespace: Arc<String>,
    state: Arc<Mutex<MetricsState>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(&format!("{METRICS_NAMESPACE}.{name}"))
            .copied()
            .or_else(|| self.counters.get(name).copied())
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges
            .get(&format!("{METRICS_NAMESPACE}.{name}"))
            .or_else(|| self.gauges.get(name))
            .copied()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(METRICS_NAMESPACE)
    }
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Arc::new(namespace.into()),
            state: Arc::new(Mutex::new(MetricsState::default())),
        }
    }

    pub fn inc_counter(&self, name: &str, delta: u64) {
        let key = self.qualify(name);
        let mut state = self.state.lock();
        let value = state.counters.entry(key).or_insert(0);
        *value = value.saturating_add(delta);
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        let key = self.qualify(name);
        self.state.lock().gauges.insert(key, value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            counters: state.counters.clone(),
            gauges: state.gauges.clone(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        let already_qualified = name
            .strip_prefix(self.namespace.as_str())
            .is_some_and(|rest| rest.starts_with('.'));
        if already_qualified {
            name.to_string()
        } else {
            format!("{}.{}", self.namespace, name)
        }
    }
}
