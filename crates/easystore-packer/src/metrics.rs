//! Operational surface: metrics hooks and the readiness probe
//!
//! The core never talks to a metrics system directly. It emits counter
//! events through the [`MetricsSink`] capability; process wiring decides
//! whether those land in Prometheus, logs, or nowhere. The sink and the
//! shutdown signal are the only process-wide collaborators, and both are
//! injected — nothing here is looked up globally.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counter/histogram hook. Implementations must be cheap and non-blocking.
pub trait MetricsSink: Send + Sync {
    fn on_event(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn on_event(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Keeps every event in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of values recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.events()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .sum()
    }
}

impl MetricsSink for RecordingSink {
    fn on_event(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MetricEvent {
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                value,
            });
    }
}

#[derive(Debug, Default)]
struct ReadinessState {
    last_lease_renew: Option<Instant>,
    last_db_ping: Option<Instant>,
    last_store_head: Option<Instant>,
}

/// Readiness probe: ready while the last successful lease renewal, DB ping,
/// and object-store HEAD are all fresh.
#[derive(Debug)]
pub struct Readiness {
    max_staleness: Duration,
    state: Mutex<ReadinessState>,
}

impl Readiness {
    pub fn new(max_staleness: Duration) -> Self {
        Self {
            max_staleness,
            state: Mutex::new(ReadinessState::default()),
        }
    }

    pub fn record_lease_renew(&self) {
        self.lock().last_lease_renew = Some(Instant::now());
    }

    pub fn record_db_ping(&self) {
        self.lock().last_db_ping = Some(Instant::now());
    }

    pub fn record_store_head(&self) {
        self.lock().last_store_head = Some(Instant::now());
    }

    pub fn ready(&self) -> bool {
        let state = self.lock();
        [
            state.last_lease_renew,
            state.last_db_ping,
            state.last_store_head,
        ]
        .iter()
        .all(|t| matches!(t, Some(at) if at.elapsed() <= self.max_staleness))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadinessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}
