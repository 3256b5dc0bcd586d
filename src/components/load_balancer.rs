use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// Backend selection policy.
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
pub enum LoadBalancingAlgorithm {
    /// Cycle through the healthy backends in order.
    RoundRobin,
    /// Pick the healthy backend with the fewest live connections; ties go to
    /// the earliest backend in the list.
    LeastConnections,
    /// Draw a backend with probability proportional to its weight.
    Weighted,
}

/// A downstream endpoint the load balancer can route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Component id of the backend.
    pub id: String,
    /// Selection weight for the weighted algorithm.
    #[serde(default = "default_weight")]
    pub weight: u64,
    /// Whether the backend is currently routable.
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    /// Live connection count, maintained by routing and cleanup events.
    #[serde(default)]
    pub connections: u64,
}

fn default_weight() -> u64 {
    1
}

const fn default_healthy() -> bool {
    true
}

impl Backend {
    /// Constructs a healthy backend with the given weight.
    #[must_use]
    pub fn new(id: impl Into<String>, weight: u64) -> Self {
        Self {
            id: id.into(),
            weight,
            healthy: true,
            connections: 0,
        }
    }
}

/// A load balancer routing arrivals to a set of backends.
///
/// Routed requests are emitted as `request_processed` events targeted at the
/// chosen backend. Each route also schedules a cleanup `request_completed`
/// event back at the load balancer, which releases the backend's connection;
/// least-connections selection depends on that release.
pub struct LoadBalancer {
    id: String,
    state: ComponentState,
    properties: Properties,
    algorithm: LoadBalancingAlgorithm,
    routing_latency: f64,
    failure_rate: f64,
    backends: Vec<Backend>,
    rr_index: u64,
    requests_routed: u64,
    requests_failed: u64,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl LoadBalancer {
    /// Constructs a load balancer with default parameters and no backends.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            routing_latency: 0.01,
            failure_rate: 0.001,
            backends: Vec::new(),
            rr_index: 0,
            requests_routed: 0,
            requests_failed: 0,
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Registers a healthy backend.
    pub fn add_backend(&mut self, id: impl Into<String>, weight: u64) {
        self.backends.push(Backend::new(id, weight));
    }

    /// Removes a backend by id.
    pub fn remove_backend(&mut self, id: &str) {
        self.backends.retain(|backend| backend.id != id);
    }

    /// Marks a backend healthy or unhealthy.
    pub fn set_backend_health(&mut self, id: &str, healthy: bool) {
        if let Some(backend) = self.backends.iter_mut().find(|b| b.id == id) {
            backend.healthy = healthy;
        }
    }

    /// The configured backends.
    #[must_use]
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Number of healthy backends.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.healthy).count()
    }

    fn fail(&mut self, event: &Event, reason: &str) -> Vec<Event> {
        self.requests_failed += 1;
        let fail = Event::new(
            self.ids.next("route_fail", &self.id),
            event.timestamp,
            EventKind::RequestFailed,
            self.id.clone(),
        )
        .with_data("reason", reason);
        vec![carry_data(event, fail, &["request_id"])]
    }

    fn select(&mut self) -> Option<usize> {
        let healthy: Vec<usize> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let selected = match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => {
                let index = healthy[self.rr_index as usize % healthy.len()];
                self.rr_index = self.rr_index.wrapping_add(1);
                index
            }
            LoadBalancingAlgorithm::LeastConnections => *healthy
                .iter()
                .min_by_key(|&&i| self.backends[i].connections)
                .expect("healthy set is non-empty"),
            LoadBalancingAlgorithm::Weighted => {
                let total: u64 = healthy.iter().map(|&i| self.backends[i].weight).sum();
                let mut draw = self.rng.gen_range(0..total.max(1));
                let mut selected = healthy[0];
                for &i in &healthy {
                    let weight = self.backends[i].weight;
                    if draw < weight {
                        selected = i;
                        break;
                    }
                    draw -= weight;
                }
                selected
            }
        };
        Some(selected)
    }

    fn on_request_arrival(&mut self, event: &Event) -> Vec<Event> {
        if self.healthy_count() == 0 {
            return self.fail(event, "no_healthy_servers");
        }
        if self.rng.gen::<f64>() < self.failure_rate {
            return self.fail(event, "routing_error");
        }
        let Some(index) = self.select() else {
            return self.fail(event, "no_healthy_servers");
        };

        self.backends[index].connections += 1;
        self.requests_routed += 1;
        self.state = ComponentState::Processing;
        let backend_id = self.backends[index].id.clone();

        let routed = Event::new(
            self.ids.next("routed", &self.id),
            event.timestamp + self.routing_latency,
            EventKind::RequestProcessed,
            backend_id.clone(),
        )
        .with_data("backend_server", backend_id.clone())
        .with_data("routing_latency", self.routing_latency)
        .with_data("algorithm", self.algorithm.to_string());

        // The cleanup event returns here and releases the connection.
        let cleanup = Event::new(
            self.ids.next("cleanup", &self.id),
            event.timestamp + self.routing_latency + 1.0,
            EventKind::RequestCompleted,
            self.id.clone(),
        )
        .with_data("backend_server", backend_id)
        .with_data("cleanup", true);

        vec![
            carry_data(event, routed, &["request_id"]),
            carry_data(event, cleanup, &["request_id"]),
        ]
    }

    fn on_cleanup(&mut self, event: &Event) -> Vec<Event> {
        if event.data_value("cleanup").and_then(Value::as_bool) != Some(true) {
            return Vec::new();
        }
        if let Some(backend_id) = event.data_str("backend_server") {
            if let Some(backend) = self.backends.iter_mut().find(|b| b.id == backend_id) {
                backend.connections = backend.connections.saturating_sub(1);
            }
        }
        if self.backends.iter().all(|b| b.connections == 0) {
            self.state = ComponentState::Idle;
        }
        Vec::new()
    }
}

impl Component for LoadBalancer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::LoadBalancer
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError> {
        if let Some(value) = properties.get("algorithm") {
            let name = value
                .as_str()
                .ok_or_else(|| ConfigError::InvalidProperty {
                    key: "algorithm".into(),
                    reason: "must be a string".into(),
                })?;
            self.algorithm = name.parse().map_err(|_| ConfigError::InvalidProperty {
                key: "algorithm".into(),
                reason: "must be one of: round_robin, least_connections, weighted".into(),
            })?;
        }
        properties.expect_positive("routing_latency")?;
        properties.expect_probability("failure_rate")?;
        self.routing_latency = properties.float_or("routing_latency", self.routing_latency);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        if let Some(backends) = properties.get("backends") {
            self.backends = serde_json::from_value(backends.clone()).map_err(|err| {
                ConfigError::InvalidProperty {
                    key: "backends".into(),
                    reason: err.to_string(),
                }
            })?;
        }
        self.rng = component_rng(&self.id, properties);
        self.properties = properties.clone();
        Ok(())
    }

    fn set_property(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        if self.state != ComponentState::Stopped {
            return Err(ConfigError::PropertiesLocked);
        }
        let mut properties = self.properties.clone();
        properties.insert(key, value);
        self.initialize(&properties)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if self.routing_latency <= 0.0 {
            return Err(ConfigError::InvalidProperty {
                key: "routing_latency".into(),
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidProperty {
                key: "failure_rate".into(),
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.backends.iter().any(|b| b.weight == 0) {
            return Err(ConfigError::InvalidProperty {
                key: "backends".into(),
                reason: "backend weights must be at least 1".into(),
            });
        }
        Ok(())
    }

    fn start(&mut self, _ctx: &SimContext) {
        self.rr_index = 0;
        self.requests_routed = 0;
        self.requests_failed = 0;
        self.events_handled = 0;
        for backend in &mut self.backends {
            backend.connections = 0;
        }
        self.ids.reset();
        self.state = ComponentState::Idle;
    }

    fn stop(&mut self, _ctx: &SimContext) {
        self.state = ComponentState::Stopped;
    }

    fn handle_event(&mut self, ctx: &SimContext, event: &Event) -> Vec<Event> {
        if ctx.is_cancelled() {
            return Vec::new();
        }
        self.events_handled += 1;
        match event.kind {
            EventKind::RequestArrival => self.on_request_arrival(event),
            EventKind::RequestCompleted => self.on_cleanup(event),
            EventKind::FaultInjected => {
                self.state = ComponentState::Failed;
                Vec::new()
            }
            EventKind::FaultRecovered => {
                if self.state == ComponentState::Failed {
                    self.state = ComponentState::Idle;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn metrics(&self) -> ComponentMetrics {
        let total_connections: u64 = self.backends.iter().map(|b| b.connections).sum();
        let mut metrics = ComponentMetrics::new(self.requests_routed, self.requests_failed, 0.0)
            .with("algorithm", self.algorithm.to_string())
            .with("routing_latency", self.routing_latency)
            .with("backend_count", self.backends.len())
            .with("healthy_backend_count", self.healthy_count())
            .with("total_connections", total_connections);
        metrics.events_handled = self.events_handled;
        metrics
    }
}
