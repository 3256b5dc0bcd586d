#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::default_trait_access,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! Discrete-event simulation of distributed-system topologies.
//!
//! A topology is assembled from six component kinds (services, databases,
//! message queues, load balancers, caches, API gateways), each configured
//! with performance and reliability parameters. The engine advances a
//! virtual clock by dispatching timestamped events to components, which
//! react by emitting further events.

pub mod adapter;
pub mod components;

mod component;
mod engine;
mod event;
mod factory;
mod listener;
mod metrics;
mod properties;
mod queue;
mod scenario;

pub use component::{
    CancellationToken, Component, ComponentKind, ComponentState, ConfigError, EventIdGen,
    SimContext,
};
pub use engine::{
    EngineConfig, EngineError, EventHandler, ScheduleError, SimulationEngine, SimulationState,
};
pub use event::{Event, EventKind};
pub use factory::ComponentFactory;
pub use listener::{write_from_channel, ChannelListener, EventListener, TraceLog};
pub use metrics::{success_rate, ComponentMetrics, EngineMetrics};
pub use properties::Properties;
pub use queue::{EventQueue, QueueStats};
pub use scenario::{ComponentSpec, Scenario};
