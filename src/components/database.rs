use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// A connection-limited database.
///
/// Read, write and query operations each take a connection for the duration
/// of their modeled latency. The connection is released when the completion
/// event is dispatched back to the database, so `connection_limit_exceeded`
/// fires once `max_connections` operations are in flight.
pub struct Database {
    id: String,
    state: ComponentState,
    properties: Properties,
    read_latency: f64,
    write_latency: f64,
    query_latency: f64,
    failure_rate: f64,
    max_connections: u64,
    current_connections: u64,
    reads_processed: u64,
    writes_processed: u64,
    queries_processed: u64,
    operations_failed: u64,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl Database {
    /// Constructs a database with default parameters.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            read_latency: 0.1,
            write_latency: 0.2,
            query_latency: 0.5,
            failure_rate: 0.001,
            max_connections: 100,
            current_connections: 0,
            reads_processed: 0,
            writes_processed: 0,
            queries_processed: 0,
            operations_failed: 0,
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Number of connections currently held.
    #[must_use]
    pub fn current_connections(&self) -> u64 {
        self.current_connections
    }

    /// Fraction of the connection pool in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.current_connections as f64 / self.max_connections as f64
    }

    fn operation(kind: EventKind) -> (&'static str, fn(&mut Database)) {
        match kind {
            EventKind::DatabaseRead => ("read", |db| db.reads_processed += 1),
            EventKind::DatabaseWrite => ("write", |db| db.writes_processed += 1),
            _ => ("query", |db| db.queries_processed += 1),
        }
    }

    fn latency(&self, kind: EventKind) -> f64 {
        match kind {
            EventKind::DatabaseRead => self.read_latency,
            EventKind::DatabaseWrite => self.write_latency,
            _ => self.query_latency,
        }
    }

    fn on_operation(&mut self, event: &Event) -> Vec<Event> {
        let (operation, count) = Self::operation(event.kind);

        if self.current_connections >= self.max_connections {
            self.operations_failed += 1;
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "connection_limit_exceeded")
            .with_data("operation", operation);
            return vec![carry_data(event, fail, &["request_id"])];
        }

        self.current_connections += 1;
        self.state = ComponentState::Processing;

        if self.rng.gen::<f64>() < self.failure_rate {
            self.operations_failed += 1;
            self.current_connections -= 1;
            if self.current_connections == 0 {
                self.state = ComponentState::Idle;
            }
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp + 0.01,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "database_error")
            .with_data("operation", operation);
            return vec![carry_data(event, fail, &["request_id"])];
        }

        count(self);
        let latency = self.latency(event.kind);
        let completed = Event::new(
            self.ids.next("complete", &self.id),
            event.timestamp + latency,
            EventKind::RequestCompleted,
            self.id.clone(),
        )
        .with_data("operation", operation)
        .with_data("latency", latency);
        vec![carry_data(event, completed, &["request_id", "data_size"])]
    }

    fn on_completed(&mut self, event: &Event) -> Vec<Event> {
        // Completion of one of our own operations releases its connection.
        if event.data_value("operation").is_some() {
            self.current_connections = self.current_connections.saturating_sub(1);
            if self.current_connections == 0 {
                self.state = ComponentState::Idle;
            }
        }
        Vec::new()
    }
}

impl Component for Database {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Database
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError> {
        for key in ["read_latency", "write_latency", "query_latency"] {
            properties.expect_positive(key)?;
        }
        properties.expect_probability("failure_rate")?;
        properties.expect_positive("max_connections")?;
        self.read_latency = properties.float_or("read_latency", self.read_latency);
        self.write_latency = properties.float_or("write_latency", self.write_latency);
        self.query_latency = properties.float_or("query_latency", self.query_latency);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        self.max_connections = properties.int_or("max_connections", self.max_connections);
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
        for (key, value) in [
            ("read_latency", self.read_latency),
            ("write_latency", self.write_latency),
            ("query_latency", self.query_latency),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::InvalidProperty {
                    key: key.into(),
                    reason: "must be positive".into(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidProperty {
                key: "failure_rate".into(),
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidProperty {
                key: "max_connections".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    fn start(&mut self, _ctx: &SimContext) {
        self.current_connections = 0;
        self.reads_processed = 0;
        self.writes_processed = 0;
        self.queries_processed = 0;
        self.operations_failed = 0;
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
            EventKind::DatabaseRead | EventKind::DatabaseWrite | EventKind::DatabaseQuery => {
                self.on_operation(event)
            }
            EventKind::RequestCompleted => self.on_completed(event),
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
        let completed = self.reads_processed + self.writes_processed + self.queries_processed;
        let mut metrics =
            ComponentMetrics::new(completed, self.operations_failed, self.utilization())
                .with("current_connections", self.current_connections)
                .with("max_connections", self.max_connections)
                .with("reads_processed", self.reads_processed)
                .with("writes_processed", self.writes_processed)
                .with("queries_processed", self.queries_processed)
                .with("read_latency", self.read_latency)
                .with("write_latency", self.write_latency)
                .with("query_latency", self.query_latency);
        metrics.events_handled = self.events_handled;
        metrics
    }
}
