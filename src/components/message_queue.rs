use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// A bounded message queue.
///
/// Messages enqueued while the queue is full are dropped with `queue_full`.
/// The first insert into an empty queue schedules an automatic dequeue
/// shortly after, which keeps the queue draining without an attached
/// consumer; set `auto_drain` to `false` to drive dequeues externally.
pub struct MessageQueue {
    id: String,
    state: ComponentState,
    properties: Properties,
    processing_time: f64,
    failure_rate: f64,
    max_size: u64,
    auto_drain: bool,
    current_size: u64,
    messages_enqueued: u64,
    messages_dequeued: u64,
    messages_failed: u64,
    messages_dropped: u64,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl MessageQueue {
    /// Constructs a message queue with default parameters.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            processing_time: 0.1,
            failure_rate: 0.001,
            max_size: 1000,
            auto_drain: true,
            current_size: 0,
            messages_enqueued: 0,
            messages_dequeued: 0,
            messages_failed: 0,
            messages_dropped: 0,
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Number of messages currently queued.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Returns `true` if the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.current_size >= self.max_size
    }

    fn on_enqueue(&mut self, event: &Event) -> Vec<Event> {
        if self.current_size >= self.max_size {
            self.messages_dropped += 1;
            let drop = Event::new(
                self.ids.next("drop", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "queue_full")
            .with_data("operation", "enqueue");
            return vec![carry_data(event, drop, &["message_id"])];
        }

        if self.rng.gen::<f64>() < self.failure_rate {
            self.messages_failed += 1;
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "enqueue_error")
            .with_data("operation", "enqueue");
            return vec![carry_data(event, fail, &["message_id"])];
        }

        self.current_size += 1;
        self.messages_enqueued += 1;
        self.state = ComponentState::Processing;

        let success = Event::new(
            self.ids.next("enqueued", &self.id),
            event.timestamp + self.processing_time,
            EventKind::RequestCompleted,
            self.id.clone(),
        )
        .with_data("operation", "enqueue")
        .with_data("queue_size", self.current_size)
        .with_data("processing_time", self.processing_time);
        let mut reactions = vec![carry_data(event, success, &["message_id"])];

        // The insert that makes the queue non-empty wakes the drain.
        if self.auto_drain && self.current_size == 1 {
            let dequeue = Event::new(
                self.ids.next("auto_dequeue", &self.id),
                event.timestamp + self.processing_time + 0.01,
                EventKind::MessageDequeued,
                self.id.clone(),
            )
            .with_data("auto", true);
            reactions.push(carry_data(event, dequeue, &["message_id"]));
        }
        reactions
    }

    fn on_dequeue(&mut self, event: &Event) -> Vec<Event> {
        if self.current_size == 0 {
            let empty = Event::new(
                self.ids.next("empty", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "queue_empty")
            .with_data("operation", "dequeue");
            return vec![carry_data(event, empty, &["message_id"])];
        }

        if self.rng.gen::<f64>() < self.failure_rate {
            self.messages_failed += 1;
            let fail = Event::new(
                self.ids.next("fail", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "dequeue_error")
            .with_data("operation", "dequeue");
            return vec![carry_data(event, fail, &["message_id"])];
        }

        self.current_size -= 1;
        self.messages_dequeued += 1;
        if self.current_size == 0 {
            self.state = ComponentState::Idle;
        }

        let success = Event::new(
            self.ids.next("dequeued", &self.id),
            event.timestamp + self.processing_time,
            EventKind::RequestCompleted,
            self.id.clone(),
        )
        .with_data("operation", "dequeue")
        .with_data("queue_size", self.current_size)
        .with_data("processing_time", self.processing_time);
        vec![carry_data(event, success, &["message_id"])]
    }
}

impl Component for MessageQueue {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::MessageQueue
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
        properties.expect_positive("max_size")?;
        if let Some(value) = properties.get("auto_drain") {
            if !value.is_boolean() {
                return Err(ConfigError::InvalidProperty {
                    key: "auto_drain".into(),
                    reason: "must be a boolean".into(),
                });
            }
        }
        self.processing_time = properties.float_or("processing_time", self.processing_time);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        self.max_size = properties.int_or("max_size", self.max_size);
        self.auto_drain = properties.bool_or("auto_drain", self.auto_drain);
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
        if self.max_size == 0 {
            return Err(ConfigError::InvalidProperty {
                key: "max_size".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    fn start(&mut self, _ctx: &SimContext) {
        self.current_size = 0;
        self.messages_enqueued = 0;
        self.messages_dequeued = 0;
        self.messages_failed = 0;
        self.messages_dropped = 0;
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
            EventKind::MessageEnqueued => self.on_enqueue(event),
            EventKind::MessageDequeued => self.on_dequeue(event),
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
        let completed = self.messages_enqueued + self.messages_dequeued;
        let failed = self.messages_failed + self.messages_dropped;
        let mut metrics = ComponentMetrics::new(
            completed,
            failed,
            self.current_size as f64 / self.max_size as f64,
        )
        .with("current_size", self.current_size)
        .with("max_size", self.max_size)
        .with("messages_enqueued", self.messages_enqueued)
        .with("messages_dequeued", self.messages_dequeued)
        .with("messages_failed", self.messages_failed)
        .with("messages_dropped", self.messages_dropped)
        .with("processing_time", self.processing_time);
        metrics.events_handled = self.events_handled;
        metrics
    }
}
