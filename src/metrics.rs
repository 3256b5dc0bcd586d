use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;

use crate::EventKind;

/// Observable snapshot of a component's counters.
///
/// The named fields are common to all component kinds; per-kind counters
/// (cache hits, messages dropped, route statistics...) live in the `extra`
/// map and are flattened into the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentMetrics {
    /// Total events handled by the component.
    pub events_handled: u64,
    /// Successfully completed operations.
    pub requests_completed: u64,
    /// Failed operations, including capacity rejections.
    pub requests_failed: u64,
    /// Handler errors that were logged and skipped.
    pub error_count: u64,
    /// `requests_completed / (requests_completed + requests_failed)`,
    /// or 1.0 before any traffic.
    pub success_rate: f64,
    /// Fraction of capacity currently in use, where applicable.
    pub utilization: f64,
    /// Per-kind counters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ComponentMetrics {
    /// Constructs a snapshot with the derived rates filled in.
    #[must_use]
    pub fn new(completed: u64, failed: u64, utilization: f64) -> Self {
        Self {
            events_handled: 0,
            requests_completed: completed,
            requests_failed: failed,
            error_count: 0,
            success_rate: success_rate(completed, failed),
            utilization,
            extra: BTreeMap::new(),
        }
    }

    /// Inserts a per-kind counter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Ratio of completed operations to all finished operations; 1.0 when no
/// operation finished yet.
#[must_use]
pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let total = completed + failed;
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}

/// Aggregate counters for a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    /// Total events dispatched so far.
    pub events_processed: u64,
    /// Number of registered components.
    pub components_active: usize,
    /// Virtual time of the last dispatched event.
    pub current_time: f64,
    /// Wall-clock time the run started, if it did.
    pub start_time: Option<SystemTime>,
    /// Wall-clock time the run ended, if it did.
    pub end_time: Option<SystemTime>,
    /// Dispatched event counts per kind.
    pub event_kind_stats: HashMap<EventKind, u64>,
    /// Dispatched event counts per target component.
    pub component_stats: HashMap<String, u64>,
    /// Dispatch errors that were logged and skipped.
    pub error_count: u64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            events_processed: 0,
            components_active: 0,
            current_time: 0.0,
            start_time: None,
            end_time: None,
            event_kind_stats: HashMap::new(),
            component_stats: HashMap::new(),
            error_count: 0,
        }
    }
}

impl EngineMetrics {
    /// Records a dispatched event.
    pub fn record(&mut self, kind: EventKind, component_id: &str, time: f64) {
        self.events_processed += 1;
        self.current_time = time;
        *self.event_kind_stats.entry(kind).or_default() += 1;
        *self
            .component_stats
            .entry(component_id.to_string())
            .or_default() += 1;
    }

    /// Zeroes every counter; used by engine reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 1.0);
        assert_eq!(success_rate(3, 1), 0.75);
        assert_eq!(success_rate(0, 5), 0.0);
    }

    #[test]
    fn test_extra_counters_flatten() {
        let metrics = ComponentMetrics::new(2, 0, 0.5).with("cache_hits", 2);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["requests_completed"], 2);
        assert_eq!(json["cache_hits"], 2);
    }

    #[test]
    fn test_engine_metrics_record_and_reset() {
        let mut metrics = EngineMetrics::default();
        metrics.record(EventKind::RequestArrival, "svc", 1.0);
        metrics.record(EventKind::RequestFailed, "svc", 2.0);
        assert_eq!(metrics.events_processed, 2);
        assert_eq!(metrics.current_time, 2.0);
        assert_eq!(metrics.component_stats["svc"], 2);
        metrics.reset();
        assert_eq!(metrics.events_processed, 0);
        assert!(metrics.component_stats.is_empty());
    }
}
