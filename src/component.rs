use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ComponentMetrics, Event, Properties};

/// Lifecycle state of a component.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// No work in flight.
    Idle,
    /// At least one operation in flight.
    Processing,
    /// The component marked itself failed.
    Failed,
    /// Stopped by the engine.
    Stopped,
}

/// Tag distinguishing the concrete component behaviors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Generic request-processing service.
    GenericService,
    /// Connection-limited database.
    Database,
    /// Bounded message queue.
    MessageQueue,
    /// Backend-selecting load balancer.
    LoadBalancer,
    /// LRU cache.
    Cache,
    /// Route-matching API gateway.
    ApiGateway,
}

/// Configuration error raised at component construction or registration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The component id is empty.
    #[error("component ID cannot be empty")]
    EmptyId,
    /// A property failed validation.
    #[error("invalid property `{key}`: {reason}")]
    InvalidProperty {
        /// Offending property key.
        key: String,
        /// Human-readable explanation.
        reason: String,
    },
    /// A gateway route failed validation.
    #[error("invalid route `{route}`: {reason}")]
    InvalidRoute {
        /// `METHOD:path` key of the route.
        route: String,
        /// Human-readable explanation.
        reason: String,
    },
    /// The factory does not know the requested kind.
    #[error("unsupported component kind: {0}")]
    UnsupportedKind(String),
    /// A property setter was called while the component was running.
    #[error("properties can only be changed while the component is stopped")]
    PropertiesLocked,
}

/// Cooperative cancellation token created by the engine and fired by `stop`.
///
/// All long-running loops observe it; components receive it through
/// [`SimContext`] and may short-circuit their work when it fires.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Constructs a token in the non-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the token; used by engine reset.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-dispatch context handed to component lifecycle calls.
pub struct SimContext {
    time: f64,
    cancel: CancellationToken,
}

impl SimContext {
    /// Constructs a context for the given virtual time.
    #[must_use]
    pub fn new(time: f64, cancel: CancellationToken) -> Self {
        Self { time, cancel }
    }

    /// Virtual time of the event being dispatched.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Returns `true` once the engine's cancellation token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Generator of event ids emitted by a component.
///
/// Ids are derived from a monotonic per-component sequence rather than wall
/// time, so two runs of the same scenario produce identical event streams.
#[derive(Debug, Default)]
pub struct EventIdGen {
    next: u64,
}

impl EventIdGen {
    /// Produces the next id, e.g. `complete_db-1_7`.
    pub fn next(&mut self, prefix: &str, component_id: &str) -> String {
        let id = format!("{prefix}_{component_id}_{}", self.next);
        self.next += 1;
        id
    }

    /// Restarts the sequence; used on component start.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Interface of a simulated component.
///
/// A component is a state machine driven by the engine: it consumes one
/// timestamped event at a time and returns the events it wants scheduled in
/// reaction. Reactions must not be scheduled before the consumed event's
/// timestamp; the engine rejects such events. Components own their state
/// exclusively and never touch peer state; all inter-component influence
/// flows through returned events.
///
/// Components are single-writer: only the dispatch worker calls the `&mut`
/// methods. The `Sync` bound exists so that read-only snapshots (state,
/// metrics) can be taken concurrently through the engine's registry lock.
pub trait Component: Send + Sync {
    /// Unique identifier within the engine.
    fn id(&self) -> &str;

    /// The component's kind tag.
    fn kind(&self) -> ComponentKind;

    /// Current lifecycle state.
    fn state(&self) -> ComponentState;

    /// The validated configuration the component was built from.
    fn properties(&self) -> &Properties;

    /// Copies the given properties into the component's typed fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProperty`] if a known key holds a value
    /// of the wrong type or outside its allowed range.
    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError>;

    /// Updates a configuration property. Only allowed while stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PropertiesLocked`] unless the component is
    /// stopped, or [`ConfigError::InvalidProperty`] if the value is invalid
    /// for this kind.
    fn set_property(&mut self, key: &str, value: Value) -> Result<(), ConfigError>;

    /// Checks the configuration. The engine refuses to register a component
    /// whose validation fails.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violated constraint.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Resets counters and enters the idle state.
    fn start(&mut self, ctx: &SimContext);

    /// Enters the stopped state.
    fn stop(&mut self, ctx: &SimContext);

    /// Reacts to one event, returning the events to schedule. Metrics are
    /// updated before returning.
    fn handle_event(&mut self, ctx: &SimContext, event: &Event) -> Vec<Event>;

    /// Snapshot of the component's metrics.
    fn metrics(&self) -> ComponentMetrics;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn test_event_id_gen_is_deterministic() {
        let mut ids = EventIdGen::default();
        assert_eq!(ids.next("fail", "svc"), "fail_svc_0");
        assert_eq!(ids.next("complete", "svc"), "complete_svc_1");
        ids.reset();
        assert_eq!(ids.next("fail", "svc"), "fail_svc_0");
    }

    #[test]
    fn test_kind_string_forms() {
        use std::str::FromStr;
        assert_eq!(ComponentKind::ApiGateway.to_string(), "api_gateway");
        assert_eq!(
            ComponentKind::from_str("generic_service").unwrap(),
            ComponentKind::GenericService
        );
        assert_eq!(ComponentState::Processing.to_string(), "processing");
    }
}
