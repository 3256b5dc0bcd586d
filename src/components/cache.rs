use std::collections::HashMap;

use ordered_float::OrderedFloat;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::Value;

use super::{carry_data, component_rng};
use crate::{
    Component, ComponentKind, ComponentMetrics, ComponentState, ConfigError, Event, EventIdGen,
    EventKind, Properties, SimContext,
};

/// A cached item with its byte size accounting and LRU bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Stored value.
    pub value: Value,
    /// Accounted size of the entry.
    pub size: u64,
    /// Virtual time of the last access; eviction removes the smallest.
    pub timestamp: f64,
    /// Number of hits against this entry.
    pub access_count: u64,
}

/// A byte-size-accounted LRU cache.
///
/// Reads against a present key still miss with probability `1 - hit_ratio`,
/// modeling coherence effects of a memory layer; a synthetic miss leaves the
/// entry untouched. Writes evict least-recently-accessed entries until the
/// new value fits, so `current_size` never exceeds `max_size`.
pub struct Cache {
    id: String,
    state: ComponentState,
    properties: Properties,
    hit_ratio: f64,
    access_time: f64,
    failure_rate: f64,
    max_size: u64,
    current_size: u64,
    entries: HashMap<String, CacheEntry>,
    cache_hits: u64,
    cache_misses: u64,
    cache_writes: u64,
    cache_evictions: u64,
    operations_failed: u64,
    events_handled: u64,
    rng: ChaCha8Rng,
    ids: EventIdGen,
}

impl Cache {
    /// Constructs a cache with default parameters.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rng = component_rng(&id, &Properties::new());
        Self {
            id,
            state: ComponentState::Stopped,
            properties: Properties::new(),
            hit_ratio: 0.8,
            access_time: 0.01,
            failure_rate: 0.001,
            max_size: 1000,
            current_size: 0,
            entries: HashMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            cache_writes: 0,
            cache_evictions: 0,
            operations_failed: 0,
            events_handled: 0,
            rng,
            ids: EventIdGen::default(),
        }
    }

    /// Accounted size of all entries.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Number of stored entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Looks up an entry without touching its LRU position.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }

    /// Fraction of the capacity in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.current_size as f64 / self.max_size as f64
    }

    fn fail(&mut self, event: &Event, operation: &str) -> Vec<Event> {
        self.operations_failed += 1;
        let fail = Event::new(
            self.ids.next("cache_fail", &self.id),
            event.timestamp,
            EventKind::RequestFailed,
            self.id.clone(),
        )
        .with_data("reason", "cache_error")
        .with_data("operation", operation);
        vec![carry_data(event, fail, &["key", "request_id"])]
    }

    fn on_read(&mut self, event: &Event) -> Vec<Event> {
        if self.rng.gen::<f64>() < self.failure_rate {
            return self.fail(event, "read");
        }
        let key = event.data_str("key").unwrap_or_default().to_string();

        let hit = match self.entries.get_mut(&key) {
            Some(entry) => {
                let hit = self.rng.gen::<f64>() < self.hit_ratio;
                if hit {
                    entry.access_count += 1;
                    entry.timestamp = event.timestamp;
                }
                hit
            }
            None => false,
        };

        let reaction = if hit {
            self.cache_hits += 1;
            Event::new(
                self.ids.next("cache_hit", &self.id),
                event.timestamp + self.access_time,
                EventKind::RequestCompleted,
                self.id.clone(),
            )
            .with_data("result", "hit")
        } else {
            self.cache_misses += 1;
            Event::new(
                self.ids.next("cache_miss", &self.id),
                event.timestamp + self.access_time,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("result", "miss")
        }
        .with_data("operation", "read")
        .with_data("key", key)
        .with_data("access_time", self.access_time);
        vec![carry_data(event, reaction, &["request_id"])]
    }

    fn on_write(&mut self, event: &Event) -> Vec<Event> {
        if self.rng.gen::<f64>() < self.failure_rate {
            return self.fail(event, "write");
        }
        let key = event.data_str("key").unwrap_or_default().to_string();
        let size = event
            .data_value("size")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let value = event
            .data_value("value")
            .cloned()
            .unwrap_or(Value::Null);

        if size > self.max_size {
            self.operations_failed += 1;
            let fail = Event::new(
                self.ids.next("cache_fail", &self.id),
                event.timestamp,
                EventKind::RequestFailed,
                self.id.clone(),
            )
            .with_data("reason", "value_too_large")
            .with_data("operation", "write")
            .with_data("key", key);
            return vec![carry_data(event, fail, &["request_id"])];
        }

        // Size already held by an existing entry under this key is reusable.
        let reclaimed = self.entries.get(&key).map_or(0, |entry| entry.size);
        while self.current_size - reclaimed + size > self.max_size {
            self.evict_lru(&key);
        }

        self.current_size -= reclaimed;
        self.current_size += size;
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                entry.value = value.clone();
                entry.size = size;
                entry.timestamp = event.timestamp;
                entry.access_count += 1;
            })
            .or_insert_with(|| CacheEntry {
                key: key.clone(),
                value,
                size,
                timestamp: event.timestamp,
                access_count: 1,
            });
        self.cache_writes += 1;

        let completed = Event::new(
            self.ids.next("cache_write", &self.id),
            event.timestamp + self.access_time,
            EventKind::RequestCompleted,
            self.id.clone(),
        )
        .with_data("operation", "write")
        .with_data("key", key)
        .with_data("size", size)
        .with_data("access_time", self.access_time);
        vec![carry_data(event, completed, &["request_id"])]
    }

    /// Removes the entry with the smallest last-access timestamp, breaking
    /// ties by key so that eviction order is deterministic. The key being
    /// written is never evicted; its size is reclaimed by the caller.
    fn evict_lru(&mut self, protected: &str) {
        let oldest = self
            .entries
            .values()
            .filter(|entry| entry.key != protected)
            .min_by_key(|entry| (OrderedFloat(entry.timestamp), entry.key.clone()))
            .map(|entry| entry.key.clone());
        if let Some(key) = oldest {
            if let Some(entry) = self.entries.remove(&key) {
                self.current_size -= entry.size;
                self.cache_evictions += 1;
            }
        }
    }
}

impl Component for Cache {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Cache
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn initialize(&mut self, properties: &Properties) -> Result<(), ConfigError> {
        properties.expect_probability("hit_ratio")?;
        properties.expect_positive("access_time")?;
        properties.expect_probability("failure_rate")?;
        properties.expect_positive("max_size")?;
        self.hit_ratio = properties.float_or("hit_ratio", self.hit_ratio);
        self.access_time = properties.float_or("access_time", self.access_time);
        self.failure_rate = properties.float_or("failure_rate", self.failure_rate);
        self.max_size = properties.int_or("max_size", self.max_size);
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
        if !(0.0..=1.0).contains(&self.hit_ratio) {
            return Err(ConfigError::InvalidProperty {
                key: "hit_ratio".into(),
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.access_time <= 0.0 {
            return Err(ConfigError::InvalidProperty {
                key: "access_time".into(),
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
        self.clear();
        self.cache_hits = 0;
        self.cache_misses = 0;
        self.cache_writes = 0;
        self.cache_evictions = 0;
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
            EventKind::DatabaseRead => self.on_read(event),
            EventKind::DatabaseWrite => self.on_write(event),
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
        let completed = self.cache_hits + self.cache_writes;
        let failed = self.cache_misses + self.operations_failed;
        let total_reads = self.cache_hits + self.cache_misses;
        let actual_hit_ratio = if total_reads == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total_reads as f64
        };
        let mut metrics = ComponentMetrics::new(completed, failed, self.utilization())
            .with("current_size", self.current_size)
            .with("max_size", self.max_size)
            .with("entry_count", self.entries.len())
            .with("cache_hits", self.cache_hits)
            .with("cache_misses", self.cache_misses)
            .with("cache_writes", self.cache_writes)
            .with("cache_evictions", self.cache_evictions)
            .with("operations_failed", self.operations_failed)
            .with("actual_hit_ratio", actual_hit_ratio)
            .with("access_time", self.access_time);
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

    fn cache(max_size: u64) -> Cache {
        let mut cache = Cache::new("cache");
        cache
            .initialize(
                &Properties::new()
                    .with("hit_ratio", 1.0)
                    .with("access_time", 0.01)
                    .with("failure_rate", 0.0)
                    .with("max_size", max_size),
            )
            .unwrap();
        cache.start(&ctx(0.0));
        cache
    }

    fn write(key: &str, size: u64, time: f64) -> Event {
        Event::new(format!("w_{key}"), time, EventKind::DatabaseWrite, "cache")
            .with_data("key", key)
            .with_data("size", size)
            .with_data("value", key)
    }

    fn read(key: &str, time: f64) -> Event {
        Event::new(format!("r_{key}"), time, EventKind::DatabaseRead, "cache").with_data("key", key)
    }

    #[test]
    fn test_write_then_hit() {
        let mut cache = cache(10);
        let out = cache.handle_event(&ctx(1.0), &write("a", 1, 1.0));
        assert_eq!(out[0].kind, EventKind::RequestCompleted);
        assert!((out[0].timestamp - 1.01).abs() < 1e-9);

        let out = cache.handle_event(&ctx(2.0), &read("a", 2.0));
        assert_eq!(out[0].kind, EventKind::RequestCompleted);
        assert_eq!(out[0].data_str("result"), Some("hit"));
        assert_eq!(cache.entry("a").unwrap().timestamp, 2.0);
        assert_eq!(cache.entry("a").unwrap().access_count, 2);
    }

    #[test]
    fn test_absent_key_misses() {
        let mut cache = cache(10);
        let out = cache.handle_event(&ctx(1.0), &read("nope", 1.0));
        assert_eq!(out[0].kind, EventKind::RequestFailed);
        assert_eq!(out[0].data_str("result"), Some("miss"));
        assert_eq!(cache.metrics().extra["cache_misses"], 1);
    }

    #[test]
    fn test_synthetic_miss_leaves_entry_untouched() {
        let mut cache = Cache::new("cache");
        cache
            .initialize(
                &Properties::new()
                    .with("hit_ratio", 0.0)
                    .with("failure_rate", 0.0)
                    .with("max_size", 10),
            )
            .unwrap();
        cache.start(&ctx(0.0));
        cache.handle_event(&ctx(1.0), &write("a", 1, 1.0));
        let out = cache.handle_event(&ctx(2.0), &read("a", 2.0));
        assert_eq!(out[0].data_str("result"), Some("miss"));
        assert_eq!(cache.entry("a").unwrap().timestamp, 1.0);
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let mut cache = cache(3);
        cache.handle_event(&ctx(1.0), &write("a", 1, 1.0));
        cache.handle_event(&ctx(2.0), &write("b", 1, 2.0));
        cache.handle_event(&ctx(3.0), &write("c", 1, 3.0));
        cache.handle_event(&ctx(4.0), &write("d", 1, 4.0));
        assert!(cache.entry("a").is_none());
        assert_eq!(cache.entry_count(), 3);
        assert_eq!(cache.current_size(), 3);
        assert_eq!(cache.metrics().extra["cache_evictions"], 1);
    }

    #[test]
    fn test_read_refreshes_lru_position() {
        let mut cache = cache(3);
        cache.handle_event(&ctx(1.0), &write("a", 1, 1.0));
        cache.handle_event(&ctx(2.0), &write("b", 1, 2.0));
        cache.handle_event(&ctx(3.0), &write("c", 1, 3.0));
        cache.handle_event(&ctx(3.5), &read("a", 3.5));
        cache.handle_event(&ctx(4.0), &write("d", 1, 4.0));
        assert!(cache.entry("a").is_some());
        assert!(cache.entry("b").is_none());
    }

    #[test]
    fn test_update_adjusts_size_delta() {
        let mut cache = cache(10);
        cache.handle_event(&ctx(1.0), &write("a", 2, 1.0));
        assert_eq!(cache.current_size(), 2);
        cache.handle_event(&ctx(2.0), &write("a", 5, 2.0));
        assert_eq!(cache.current_size(), 5);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_size_accounting_invariant() {
        let mut cache = cache(5);
        for (key, size, time) in [("a", 2, 1.0), ("b", 2, 2.0), ("c", 3, 3.0), ("d", 1, 4.0)] {
            cache.handle_event(&ctx(time), &write(key, size, time));
            let total: u64 = ["a", "b", "c", "d"]
                .iter()
                .filter_map(|k| cache.entry(k))
                .map(|entry| entry.size)
                .sum();
            assert_eq!(total, cache.current_size());
            assert!(cache.current_size() <= 5);
        }
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut cache = cache(3);
        let out = cache.handle_event(&ctx(1.0), &write("huge", 4, 1.0));
        assert_eq!(out[0].kind, EventKind::RequestFailed);
        assert_eq!(out[0].data_str("reason"), Some("value_too_large"));
        assert_eq!(cache.current_size(), 0);
    }
}
