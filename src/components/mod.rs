//! The six concrete component behaviors.

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use crate::{Event, Properties};

mod cache;
mod database;
mod gateway;
mod load_balancer;
mod message_queue;
mod service;

pub use cache::{Cache, CacheEntry};
pub use database::Database;
pub use gateway::{ApiGateway, Route};
pub use load_balancer::{Backend, LoadBalancer, LoadBalancingAlgorithm};
pub use message_queue::MessageQueue;
pub use service::GenericService;

/// Builds the component's private RNG.
///
/// The seed comes from the `seed` property when present; otherwise it is
/// derived from the component id with an FNV-1a fold, so a scenario replays
/// identically without any explicit seeding.
pub(crate) fn component_rng(id: &str, properties: &Properties) -> ChaCha8Rng {
    let seed = properties
        .get("seed")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| {
            id.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(0x100_0000_01b3)
            })
        });
    ChaCha8Rng::seed_from_u64(seed)
}

/// Copies the given payload keys from `source` into `event`, skipping keys
/// the source does not carry.
pub(crate) fn carry_data(source: &Event, mut event: Event, keys: &[&str]) -> Event {
    for &key in keys {
        if let Some(value) = source.data_value(key) {
            event = event.with_data(key, value.clone());
        }
    }
    event
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::EventKind;
    use rand::RngCore;

    #[test]
    fn test_rng_is_deterministic_per_id() {
        let props = Properties::new();
        let mut a = component_rng("svc-1", &props);
        let mut b = component_rng("svc-1", &props);
        assert_eq!(a.next_u64(), b.next_u64());
        let mut c = component_rng("svc-2", &props);
        assert_ne!(component_rng("svc-1", &props).next_u64(), c.next_u64());
    }

    #[test]
    fn test_rng_honors_seed_property() {
        let props = Properties::new().with("seed", 42);
        let mut a = component_rng("svc-1", &props);
        let mut b = component_rng("other", &props);
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_carry_data() {
        let source = Event::new("e", 1.0, EventKind::RequestArrival, "svc")
            .with_data("request_id", "r1")
            .with_data("path", "/a");
        let out = Event::new("f", 1.0, EventKind::RequestFailed, "svc");
        let out = carry_data(&source, out, &["request_id", "missing"]);
        assert_eq!(out.data_str("request_id"), Some("r1"));
        assert!(out.data_value("missing").is_none());
        assert!(out.data_value("path").is_none());
    }
}
