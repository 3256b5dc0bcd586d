use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// A generic request-processing service.
///
/// Accepts up to `max_concurrency` concurrent requests; anything beyond that
/// is rejected immediately with `service_overloaded`. Accepted requests
/// either fail shortly after arrival (with probability `failure_rate`) or
/// complete after `processing_time`.
pub struct GenericService {
    id: String,
    state: ComponentState,
    properties: Properties,
    processing_time: f64,
    failure_rate: f64,
    max_concurrency: u64,
    current_load: u64,
    requests_processed: u64,
    requests_failed: u64,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl GenericService {
    /// Constructs a service with default parameters.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            processing_time: 1.0,
            failure_rate: 0.01,
            max_concurrency: 10,
            current_load: 0,
            requests_processed: 0,
            requests_failed: 0,
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn current_load(&self) -> u64 {
        self.current_load
    }

    /// Fraction of concurrency slots in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.current_load as f64 / self.max_concurrency as f64
    }

    /// Returns `true` if every concurrency slot is taken.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.current_load >= self.max_concurrency
    }

    fn on_request_arrival(&mut self, event: &Event) -> Vec<Event> {
        if self.current_load >= self.max_concurrency {
            self.requests_failed += 1;
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "service_overloaded");
            return vec![carry_data(event, fail, &["request_id"])];
        }

        self.current_load += 1;
        self.state = ComponentState::Processing;

        if self.rng.gen::<f64>() < self.failure_rate {
            self.requests_failed += 1;
            self.current_load -= 1;
            if self.current_load == 0 {
                self.state = ComponentState::Idle;
            }
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp + 0.1,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "processing_error");
            return vec![carry_data(event, fail, &["request_id"])];
        }

        let processed = Event::new(
            self.ids.next("processed", &self.id),
            event.timestamp + self.processing_time,
            EventKind::RequestProcessed,
            self.id.clone(),
        )
        .with_data("processing_time", self.processing_time);
        vec![carry_data(event, processed, &["request_id"])]
    }

    fn on_request_processed(&mut self, event: &Event) -> Vec<Event> {
        self.current_load = self.current_load.saturating_sub(1);
        self.requests_processed += 1;
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
            &["request_id", "processing_time"],
        )]
    }
}

impl Component for GenericService {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::GenericService
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError> {
        properties.expect_positive("processing_time")?;
        properties.expect_probability("failure_rate")?;
        properties.expect_positive("max_concurrency")?;
        self.processing_time = properties.float_or("processing_time", self.processing_time);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        self.max_concurrency = properties.int_or("max_concurrency", self.max_concurrency);
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
        if self.processing_time <= 0.0 {
            return Err(ConfigError::InvalidProperty {
                key: "processing_time".into(),
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidProperty {
                key: "failure_rate".into(),
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidProperty {
                key: "max_concurrency".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    fn start(&mut self, _ctx: &SimContext) {
        self.current_load = 0;
        self.requests_processed = 0;
        self.requests_failed = 0;
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
        let mut metrics = ComponentMetrics::new(
            self.requests_processed,
            self.requests_failed,
            self.utilization(),
        )
        .with("current_load", self.current_load)
        .with("max_concurrency", self.max_concurrency)
        .with("processing_time", self.processing_time)
        .with("failure_rate", self.failure_rate);
        metrics.events_handled = self.events_handled;
        metrics
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn started(mut service: GenericService) -> GenericService {
        let ctx = SimContext::new(0.0, crate::CancellationToken::new());
        service.start(&ctx);
        service
    }

    fn ctx(time: f64) -> SimContext {
        SimContext::new(time, crate::CancellationToken::new())
    }

    fn service() -> GenericService {
        let mut service = GenericService::new("svc");
        service
            .initialize(
                &Properties::new()
                    .with("processing_time", 1.0)
                    .with("failure_rate", 0.0)
                    .with("max_concurrency", 2),
            )
            .unwrap();
        started(service)
    }

    fn arrival(id: &str, time: f64) -> Event {
        Event::new(id, time, EventKind::RequestArrival, "svc").with_data("request_id", id)
    }

    #[test]
    fn test_accepts_until_capacity() {
        let mut service = service();
        let out = service.handle_event(&ctx(1.0), &arrival("r1", 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::RequestProcessed);
        assert_eq!(out[0].timestamp, 2.0);
        service.handle_event(&ctx(1.0), &arrival("r2", 1.0));
        assert_eq!(service.current_load(), 2);
        assert_eq!(service.state(), ComponentState::Processing);

        let out = service.handle_event(&ctx(1.0), &arrival("r3", 1.0));
        assert_eq!(out[0].kind, EventKind::RequestFailed);
        assert_eq!(out[0].data_str("reason"), Some("service_overloaded"));
        assert_eq!(out[0].timestamp, 1.0);
        assert_eq!(service.current_load(), 2);
    }

    #[test]
    fn test_processed_decrements_load_and_completes() {
        let mut service = service();
        let processed = service
            .handle_event(&ctx(1.0), &arrival("r1", 1.0))
            .remove(0);
        let out = service.handle_event(&ctx(2.0), &processed);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::RequestCompleted);
        assert_eq!(out[0].data_str("request_id"), Some("r1"));
        assert_eq!(service.current_load(), 0);
        assert_eq!(service.state(), ComponentState::Idle);
        assert_eq!(service.metrics().requests_completed, 1);
    }

    #[test]
    fn test_always_fails_with_unit_failure_rate() {
        let mut service = GenericService::new("svc");
        service
            .initialize(
                &Properties::new()
                    .with("failure_rate", 1.0)
                    .with("max_concurrency", 2),
            )
            .unwrap();
        let mut service = started(service);
        let out = service.handle_event(&ctx(1.0), &arrival("r1", 1.0));
        assert_eq!(out[0].kind, EventKind::RequestFailed);
        assert_eq!(out[0].data_str("reason"), Some("processing_error"));
        assert_eq!(out[0].timestamp, 1.1);
        assert_eq!(service.current_load(), 0);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut service = GenericService::new("svc");
        assert!(service
            .initialize(&Properties::new().with("failure_rate", 2.0))
            .is_err());
        service
            .initialize(&Properties::new().with("max_concurrency", 1))
            .unwrap();
        assert!(service.validate().is_ok());
        assert!(GenericService::new("").validate().is_err());
    }

    #[test]
    fn test_set_property_only_while_stopped() {
        let mut service = GenericService::new("svc");
        assert!(service.set_property("processing_time", 2.0.into()).is_ok());
        let mut service = started(service);
        assert!(matches!(
            service.set_property("processing_time", 3.0.into()),
            Err(ConfigError::PropertiesLocked)
        ));
    }
}
