use std::collections::HashMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// A route exposed by the gateway, keyed by `METHOD:path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Request path.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Component id of the backend the route forwards to.
    pub backend_url: String,
    /// Timeout attached to forwarded requests.
    pub timeout: f64,
    /// Requests per time unit allowed on this route.
    pub rate_limit: u64,
    /// Disabled routes behave as missing.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl Route {
    fn key(&self) -> String {
        format!("{}:{}", self.method, self.path)
    }
}

/// An API gateway in front of backend services.
///
/// Arrivals run through the admission pipeline in a fixed order: concurrency
/// gate, route lookup, authentication, rate limiting, gateway failure. The
/// survivors are forwarded to the route's backend after `routing_latency`.
pub struct ApiGateway {
    id: String,
    state: ComponentState,
    properties: Properties,
    routing_latency: f64,
    failure_rate: f64,
    auth_failure_rate: f64,
    rate_limit_rate: f64,
    max_concurrency: u64,
    current_load: u64,
    routes: HashMap<String, Route>,
    requests_routed: u64,
    requests_failed: u64,
    requests_blocked: u64,
    auth_failures: u64,
    rate_limit_hits: u64,
    route_stats: HashMap<String, u64>,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl ApiGateway {
    /// Constructs a gateway with default parameters and no routes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            routing_latency: 0.02,
            failure_rate: 0.001,
            auth_failure_rate: 0.1,
            rate_limit_rate: 0.05,
            max_concurrency: 1000,
            current_load: 0,
            routes: HashMap::new(),
            requests_routed: 0,
            requests_failed: 0,
            requests_blocked: 0,
            auth_failures: 0,
            rate_limit_hits: 0,
            route_stats: HashMap::new(),
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Adds an enabled route.
    pub fn add_route(
        &mut self,
        method: impl Into<String>,
        path: impl Into<String>,
        backend_url: impl Into<String>,
        timeout: f64,
        rate_limit: u64,
    ) {
        let route = Route {
            path: path.into(),
            method: method.into(),
            backend_url: backend_url.into(),
            timeout,
            rate_limit,
            enabled: true,
        };
        self.routes.insert(route.key(), route);
    }

    /// Removes a route.
    pub fn remove_route(&mut self, method: &str, path: &str) {
        self.routes.remove(&format!("{method}:{path}"));
    }

    /// Enables or disables a route.
    pub fn set_route_enabled(&mut self, method: &str, path: &str, enabled: bool) {
        if let Some(route) = self.routes.get_mut(&format!("{method}:{path}")) {
            route.enabled = enabled;
        }
    }

    /// Number of requests currently being forwarded.
    #[must_use]
    pub fn current_load(&self) -> u64 {
        self.current_load
    }

    /// Fraction of the concurrency limit in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.current_load as f64 / self.max_concurrency as f64
    }

    fn reject(&mut self, event: &Event, reason: &str) -> Vec<Event> {
        let fail = Event::new(
            self.ids.next("gateway_fail", &self.id),
            event.timestamp,
            EventKind::RequestFailed,
            self.id.clone(),
        )
        .with_data("reason", reason);
        vec![carry_data(event, fail, &["request_id", "path", "method"])]
    }

    fn on_request_arrival(&mut self, event: &Event) -> Vec<Event> {
        if self.current_load >= self.max_concurrency {
            self.requests_blocked += 1;
            return self.reject(event, "gateway_overloaded");
        }

        let method = event.data_str("method").unwrap_or_default();
        let path = event.data_str("path").unwrap_or_default();
        let key = format!("{method}:{path}");
        let Some(route) = self.routes.get(&key).filter(|route| route.enabled).cloned() else {
            self.requests_failed += 1;
            return self.reject(event, "route_not_found");
        };

        if self.rng.gen::<f64>() < self.auth_failure_rate {
            self.auth_failures += 1;
            return self.reject(event, "authentication_failed");
        }
        if self.rng.gen::<f64>() < self.rate_limit_rate {
            self.rate_limit_hits += 1;
            return self.reject(event, "rate_limit_exceeded");
        }
        if self.rng.gen::<f64>() < self.failure_rate {
            self.requests_failed += 1;
            return self.reject(event, "gateway_error");
        }

        self.current_load += 1;
        self.state = ComponentState::Processing;
        self.requests_routed += 1;
        *self.route_stats.entry(key).or_default() += 1;

        let routed = Event::new(
            self.ids.next("routed", &self.id),
            event.timestamp + self.routing_latency,
            EventKind::RequestProcessed,
            route.backend_url.clone(),
        )
        .with_data("backend_url", route.backend_url)
        .with_data("routing_latency", self.routing_latency)
        .with_data("timeout", route.timeout);
        vec![carry_data(event, routed, &["request_id", "path", "method"])]
    }

    fn on_request_processed(&mut self, event: &Event) -> Vec<Event> {
        self.current_load = self.current_load.saturating_sub(1);
        if self.current_load == 0 {
            self.state = ComponentState::Idle;
        }
        let completed = Event::new(
            self.ids.next("completed", &self.id),
            event.timestamp,
            EventKind::RequestCompleted,
            self.id.clone(),
        );
        vec![carry_data(
            event,
            completed,
            &["request_id", "backend_url", "routing_latency"],
        )]
    }
}

impl Component for ApiGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::ApiGateway
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError> {
        properties.expect_positive("routing_latency")?;
        properties.expect_probability("failure_rate")?;
        properties.expect_probability("auth_failure_rate")?;
        properties.expect_probability("rate_limit_rate")?;
        properties.expect_positive("max_concurrency")?;
        self.routing_latency = properties.float_or("routing_latency", self.routing_latency);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        self.auth_failure_rate = properties.float_or("auth_failure_rate", self.auth_failure_rate);
        self.rate_limit_rate = properties.float_or("rate_limit_rate", self.rate_limit_rate);
        self.max_concurrency = properties.int_or("max_concurrency", self.max_concurrency);
        if let Some(routes) = properties.get("routes") {
            let routes: Vec<Route> = serde_json::from_value(routes.clone()).map_err(|err| {
                ConfigError::InvalidProperty {
                    key: "routes".into(),
                    reason: err.to_string(),
                }
            })?;
            self.routes = routes
                .into_iter()
                .map(|route| (route.key(), route))
                .collect();
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
        for (key, rate) in [
            ("failure_rate", self.failure_rate),
            ("auth_failure_rate", self.auth_failure_rate),
            ("rate_limit_rate", self.rate_limit_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::InvalidProperty {
                    key: key.into(),
                    reason: "must be between 0 and 1".into(),
                });
            }
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidProperty {
                key: "max_concurrency".into(),
                reason: "must be positive".into(),
            });
        }
        for (key, route) in &self.routes {
            if route.path.is_empty() || route.method.is_empty() {
                return Err(ConfigError::InvalidRoute {
                    route: key.clone(),
                    reason: "method and path must be non-empty".into(),
                });
            }
            if route.backend_url.is_empty() {
                return Err(ConfigError::InvalidRoute {
                    route: key.clone(),
                    reason: "backend URL must be non-empty".into(),
                });
            }
            if route.timeout <= 0.0 {
                return Err(ConfigError::InvalidRoute {
                    route: key.clone(),
                    reason: "timeout must be positive".into(),
                });
            }
            if route.rate_limit == 0 {
                return Err(ConfigError::InvalidRoute {
                    route: key.clone(),
                    reason: "rate limit must be positive".into(),
                });
            }
        }
        Ok(())
    }

    fn start(&mut self, _ctx: &SimContext) {
        self.current_load = 0;
        self.requests_routed = 0;
        self.requests_failed = 0;
        self.requests_blocked = 0;
        self.auth_failures = 0;
        self.rate_limit_hits = 0;
        self.route_stats.clear();
        self.events_handled = 0;
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
            EventKind::RequestProcessed => self.on_request_processed(event),
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
        let failed = self.requests_failed
            + self.requests_blocked
            + self.auth_failures
            + self.rate_limit_hits;
        let mut metrics =
            ComponentMetrics::new(self.requests_routed, failed, self.utilization())
                .with("current_load", self.current_load)
                .with("max_concurrency", self.max_concurrency)
                .with("requests_blocked", self.requests_blocked)
                .with("auth_failures", self.auth_failures)
                .with("rate_limit_hits", self.rate_limit_hits)
                .with("routing_latency", self.routing_latency)
                .with("route_count", self.routes.len())
                .with(
                    "route_stats",
                    serde_json::to_value(&self.route_stats).unwrap_or_default(),
                );
        metrics.events_handled = self.events_handled;
        metrics
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(time: f64) -> SimContext {
        SimContext::new(time, crate::CancellationToken::new())
    }

    fn gateway() -> ApiGateway {
        let mut gw = ApiGateway::new("gw");
        gw.initialize(
            &Properties::new()
                .with("routing_latency", 0.02)
                .with("failure_rate", 0.0)
                .with("auth_failure_rate", 0.0)
                .with("rate_limit_rate", 0.0)
                .with("max_concurrency", 2),
        )
        .unwrap();
        gw.add_route("GET", "/a", "backend-x", 5.0, 100);
        gw.start(&ctx(0.0));
        gw
    }

    fn arrival(id: &str, method: &str, path: &str, time: f64) -> Event {
        Event::new(id, time, EventKind::RequestArrival, "gw")
            .with_data("request_id", id)
            .with_data("method", method)
            .with_data("path", path)
    }

    #[test]
    fn test_routes_to_backend() {
        let mut gw = gateway();
        let out = gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::RequestProcessed);
        assert_eq!(out[0].component_id, "backend-x");
        assert_eq!(out[0].data_str("backend_url"), Some("backend-x"));
        assert_eq!(out[0].data_value("timeout").unwrap().as_f64(), Some(5.0));
        assert!((out[0].timestamp - 1.02).abs() < 1e-9);
        assert_eq!(gw.current_load(), 1);
    }

    #[test]
    fn test_unknown_route_rejected() {
        let mut gw = gateway();
        let out = gw.handle_event(&ctx(1.0), &arrival("r1", "POST", "/a", 1.0));
        assert_eq!(out[0].data_str("reason"), Some("route_not_found"));
    }

    #[test]
    fn test_removed_route_no_longer_matches() {
        let mut gw = gateway();
        gw.remove_route("GET", "/a");
        let out = gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        assert_eq!(out[0].data_str("reason"), Some("route_not_found"));
        assert_eq!(gw.metrics().extra["route_count"], 0);
    }

    #[test]
    fn test_disabled_route_behaves_as_missing() {
        let mut gw = gateway();
        gw.set_route_enabled("GET", "/a", false);
        let out = gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        assert_eq!(out[0].data_str("reason"), Some("route_not_found"));
    }

    #[test]
    fn test_overload_blocks() {
        let mut gw = gateway();
        gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        gw.handle_event(&ctx(1.0), &arrival("r2", "GET", "/a", 1.0));
        let out = gw.handle_event(&ctx(1.0), &arrival("r3", "GET", "/a", 1.0));
        assert_eq!(out[0].data_str("reason"), Some("gateway_overloaded"));
        assert_eq!(gw.metrics().extra["requests_blocked"], 1);
    }

    #[test]
    fn test_returning_request_releases_load() {
        let mut gw = gateway();
        gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        assert_eq!(gw.current_load(), 1);
        let returning = Event::new("back", 2.0, EventKind::RequestProcessed, "gw")
            .with_data("request_id", "r1")
            .with_data("backend_url", "backend-x");
        let out = gw.handle_event(&ctx(2.0), &returning);
        assert_eq!(out[0].kind, EventKind::RequestCompleted);
        assert_eq!(gw.current_load(), 0);
        assert_eq!(gw.state(), ComponentState::Idle);
    }

    #[test]
    fn test_auth_failure_bucket() {
        let mut gw = ApiGateway::new("gw");
        gw.initialize(
            &Properties::new()
                .with("auth_failure_rate", 1.0)
                .with("rate_limit_rate", 0.0)
                .with("failure_rate", 0.0),
        )
        .unwrap();
        gw.add_route("GET", "/a", "backend-x", 5.0, 100);
        gw.start(&ctx(0.0));
        let out = gw.handle_event(&ctx(1.0), &arrival("r1", "GET", "/a", 1.0));
        assert_eq!(out[0].data_str("reason"), Some("authentication_failed"));
        assert_eq!(gw.metrics().extra["auth_failures"], 1);
    }

    #[test]
    fn test_route_validation() {
        let mut gw = ApiGateway::new("gw");
        gw.add_route("GET", "/a", "", 5.0, 100);
        assert!(matches!(
            gw.validate(),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }
}
