use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    CancellationToken, Component, ComponentMetrics, ConfigError, EngineMetrics, Event, EventKind,
    EventListener, EventQueue, QueueStats, SimContext,
};

/// Granularity at which a paused worker re-checks the engine state.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// State of the simulation engine.
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
pub enum SimulationState {
    /// Constructed; no run started yet.
    Initialized,
    /// The dispatch loop is consuming events.
    Running,
    /// The dispatch loop is idling until resumed.
    Paused,
    /// Stopped by the control surface.
    Stopped,
    /// Reached `max_simulation_time` or `max_events`.
    Completed,
    /// A panic escaped the dispatch loop.
    Error,
}

/// Configuration of a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Virtual time at which the run completes.
    pub max_simulation_time: f64,
    /// Clock advance per iteration while the queue is empty.
    pub time_step: f64,
    /// Sleep `time_step` wall-clock seconds on every empty-queue advance.
    pub real_time_mode: bool,
    /// Number of dispatched events after which the run completes.
    pub max_events: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_simulation_time: 1000.0,
            time_step: 0.1,
            real_time_mode: false,
            max_events: 10_000,
        }
    }
}

/// Error returned by [`SimulationEngine::schedule_event`].
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The event's timestamp precedes the current virtual time.
    #[error(
        "cannot schedule event in the past: event time {event_time} < current time {current_time}"
    )]
    TemporalViolation {
        /// Timestamp of the rejected event.
        event_time: f64,
        /// Virtual time at the moment of the call.
        current_time: f64,
    },
}

/// Error returned by the engine's control operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` was called while already running.
    #[error("simulation is already running")]
    AlreadyRunning,
    /// `stop` or `pause` was called while not running.
    #[error("simulation is not running")]
    NotRunning,
    /// `resume` was called while not paused.
    #[error("simulation is not paused")]
    NotPaused,
    /// A mutating operation was attempted during a run.
    #[error("cannot {action} while simulation is running")]
    Running {
        /// The rejected operation.
        action: &'static str,
    },
    /// The referenced component is not registered.
    #[error("component {0} not found")]
    UnknownComponent(String),
    /// Component validation failed at registration.
    #[error("component validation failed: {0}")]
    InvalidComponent(#[from] ConfigError),
}

/// Handler invoked for every dispatched event of a registered kind, after the
/// target component has handled it.
pub type EventHandler = Box<dyn FnMut(&Event) + Send>;

struct Clock {
    state: SimulationState,
    current_time: f64,
}

struct Shared {
    config: EngineConfig,
    clock: Mutex<Clock>,
    queue: EventQueue,
    components: RwLock<HashMap<String, Box<dyn Component>>>,
    handlers: Mutex<HashMap<EventKind, Vec<EventHandler>>>,
    listeners: Mutex<Vec<Box<dyn EventListener>>>,
    metrics: Mutex<EngineMetrics>,
    cancel: CancellationToken,
}

/// The discrete-event simulation engine.
///
/// A single dispatch worker owns the advance of virtual time and the mutation
/// of component state. The control surface (`schedule_event`, `pause`,
/// `stop`, `metrics`...) may be called concurrently; the registry, the clock
/// and the metrics each sit behind their own lock, and the event queue is
/// internally synchronized.
pub struct SimulationEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SimulationEngine {
    /// Constructs an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                clock: Mutex::new(Clock {
                    state: SimulationState::Initialized,
                    current_time: 0.0,
                }),
                queue: EventQueue::new(),
                components: RwLock::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                metrics: Mutex::new(EngineMetrics::default()),
                cancel: CancellationToken::new(),
            }),
            worker: None,
        }
    }

    /// The engine's cancellation token; fired by [`stop`](Self::stop).
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> SimulationState {
        self.shared.clock.lock().expect("clock lock poisoned").state
    }

    /// Current virtual time.
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.shared
            .clock
            .lock()
            .expect("clock lock poisoned")
            .current_time
    }

    /// Registers a component. The component is validated first and rejected
    /// on failure.
    ///
    /// # Errors
    ///
    /// Returns an error while the simulation is running, or when validation
    /// fails.
    pub fn add_component(&self, component: Box<dyn Component>) -> Result<(), EngineError> {
        let clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state == SimulationState::Running {
            return Err(EngineError::Running {
                action: "add components",
            });
        }
        component.validate()?;
        log::info!(
            "Added component: {} (kind: {})",
            component.id(),
            component.kind()
        );
        self.shared
            .components
            .write()
            .expect("component registry lock poisoned")
            .insert(component.id().to_string(), component);
        Ok(())
    }

    /// Removes a component and purges its pending events from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error while the simulation is running, or when the
    /// component is unknown.
    pub fn remove_component(&self, component_id: &str) -> Result<(), EngineError> {
        let clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state == SimulationState::Running {
            return Err(EngineError::Running {
                action: "remove components",
            });
        }
        let mut components = self
            .shared
            .components
            .write()
            .expect("component registry lock poisoned");
        if components.remove(component_id).is_none() {
            return Err(EngineError::UnknownComponent(component_id.to_string()));
        }
        let purged = self.shared.queue.remove_for_component(component_id);
        log::info!("Removed component: {component_id} ({purged} pending events purged)");
        Ok(())
    }

    /// Returns `true` if a component with the given id is registered.
    #[must_use]
    pub fn has_component(&self, component_id: &str) -> bool {
        self.shared
            .components
            .read()
            .expect("component registry lock poisoned")
            .contains_key(component_id)
    }

    /// Schedules an event.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TemporalViolation`] when the event's
    /// timestamp precedes the current virtual time; the queue is unchanged.
    pub fn schedule_event(&self, event: Event) -> Result<(), ScheduleError> {
        let current_time = self.current_time();
        if event.timestamp < current_time {
            return Err(ScheduleError::TemporalViolation {
                event_time: event.timestamp,
                current_time,
            });
        }
        log::debug!("Scheduled event: {} at time {}", event.kind, event.timestamp);
        self.shared.queue.enqueue(event);
        Ok(())
    }

    /// Registers a handler invoked after the target component has handled an
    /// event of the given kind. Multiple handlers per kind are allowed.
    pub fn register_handler<F>(&self, kind: EventKind, handler: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Adds a listener notified of every dispatched event, in dispatch order.
    pub fn add_listener(&self, listener: Box<dyn EventListener>) {
        self.shared
            .listeners
            .lock()
            .expect("listener list lock poisoned")
            .push(listener);
    }

    /// Starts the dispatch worker in a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] when already running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.begin_run()?;
        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || run_loop(&shared)));
        Ok(())
    }

    /// Runs the dispatch loop on the calling thread until the simulation
    /// completes, stops or errors. This is the deterministic entry point used
    /// by the command line and by tests.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] when already running.
    pub fn run(&mut self) -> Result<(), EngineError> {
        self.begin_run()?;
        run_loop(&self.shared);
        Ok(())
    }

    fn begin_run(&mut self) -> Result<(), EngineError> {
        let mut clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state == SimulationState::Running {
            return Err(EngineError::AlreadyRunning);
        }
        self.shared.cancel.reset();
        let ctx = SimContext::new(clock.current_time, self.shared.cancel.clone());
        let mut components = self
            .shared
            .components
            .write()
            .expect("component registry lock poisoned");
        for component in components.values_mut() {
            component.start(&ctx);
        }
        clock.state = SimulationState::Running;
        let mut metrics = self.shared.metrics.lock().expect("metrics lock poisoned");
        metrics.start_time = Some(SystemTime::now());
        metrics.components_active = components.len();
        log::info!("Simulation started with {} components", components.len());
        Ok(())
    }

    /// Fires the cancellation token, stops all components and joins the
    /// worker thread if one is running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] unless the state is running or
    /// paused.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        {
            let mut clock = self.shared.clock.lock().expect("clock lock poisoned");
            if clock.state != SimulationState::Running && clock.state != SimulationState::Paused {
                return Err(EngineError::NotRunning);
            }
            self.shared.cancel.cancel();
            clock.state = SimulationState::Stopped;
            let mut metrics = self.shared.metrics.lock().expect("metrics lock poisoned");
            metrics.end_time = Some(SystemTime::now());
            log::info!("Simulation stopped at time {}", clock.current_time);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let time = self.current_time();
        let ctx = SimContext::new(time, self.shared.cancel.clone());
        let mut components = self
            .shared
            .components
            .write()
            .expect("component registry lock poisoned");
        for component in components.values_mut() {
            component.stop(&ctx);
        }
        Ok(())
    }

    /// Pauses the dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] unless running.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state != SimulationState::Running {
            return Err(EngineError::NotRunning);
        }
        clock.state = SimulationState::Paused;
        log::info!("Simulation paused at time {}", clock.current_time);
        Ok(())
    }

    /// Resumes a paused dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotPaused`] unless paused.
    pub fn resume(&self) -> Result<(), EngineError> {
        let mut clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state != SimulationState::Paused {
            return Err(EngineError::NotPaused);
        }
        clock.state = SimulationState::Running;
        log::info!("Simulation resumed at time {}", clock.current_time);
        Ok(())
    }

    /// Resets the engine to its initial state: zeroes the clock and metrics,
    /// clears the queue and stops all components.
    ///
    /// # Errors
    ///
    /// Returns an error while the simulation is running.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let mut clock = self.shared.clock.lock().expect("clock lock poisoned");
        if clock.state == SimulationState::Running {
            return Err(EngineError::Running { action: "reset" });
        }
        clock.current_time = 0.0;
        clock.state = SimulationState::Initialized;
        self.shared.queue.clear();
        self.shared
            .metrics
            .lock()
            .expect("metrics lock poisoned")
            .reset();
        let ctx = SimContext::new(0.0, self.shared.cancel.clone());
        let mut components = self
            .shared
            .components
            .write()
            .expect("component registry lock poisoned");
        for component in components.values_mut() {
            component.stop(&ctx);
        }
        self.shared.cancel.reset();
        log::info!("Simulation reset");
        Ok(())
    }

    /// Deep-copy snapshot of the engine metrics.
    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        let mut metrics = self
            .shared
            .metrics
            .lock()
            .expect("metrics lock poisoned")
            .clone();
        metrics.current_time = self.current_time();
        metrics.components_active = self
            .shared
            .components
            .read()
            .expect("component registry lock poisoned")
            .len();
        metrics
    }

    /// Metric snapshots of every registered component.
    #[must_use]
    pub fn component_metrics(&self) -> HashMap<String, ComponentMetrics> {
        self.shared
            .components
            .read()
            .expect("component registry lock poisoned")
            .iter()
            .map(|(id, component)| (id.clone(), component.metrics()))
            .collect()
    }

    /// Statistics of the pending event queue.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }
}

fn run_loop(shared: &Shared) {
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }
        let (state, current_time) = {
            let clock = shared.clock.lock().expect("clock lock poisoned");
            (clock.state, clock.current_time)
        };
        match state {
            SimulationState::Running => {}
            SimulationState::Paused => {
                thread::sleep(PAUSE_POLL);
                continue;
            }
            _ => return,
        }

        if current_time >= shared.config.max_simulation_time {
            complete(shared, current_time);
            return;
        }

        let Some(event) = shared.queue.dequeue() else {
            // Nothing scheduled; advance the clock by one step.
            let mut clock = shared.clock.lock().expect("clock lock poisoned");
            clock.current_time += shared.config.time_step;
            drop(clock);
            if shared.config.real_time_mode {
                thread::sleep(Duration::from_secs_f64(shared.config.time_step));
            }
            continue;
        };

        // Virtual time is set by the event; it never rewinds because the
        // queue only holds events at or after the current time.
        {
            let mut clock = shared.clock.lock().expect("clock lock poisoned");
            clock.current_time = event.timestamp;
        }

        let dispatched = catch_unwind(AssertUnwindSafe(|| dispatch(shared, &event)));
        if dispatched.is_err() {
            log::error!("Simulation panicked while dispatching event {}", event.id);
            let mut clock = shared.clock.lock().expect("clock lock poisoned");
            clock.state = SimulationState::Error;
            return;
        }

        {
            let mut listeners = shared.listeners.lock().expect("listener list lock poisoned");
            for listener in listeners.iter_mut() {
                listener.on_event(&event);
            }
        }

        let events_processed = {
            let mut metrics = shared.metrics.lock().expect("metrics lock poisoned");
            metrics.record(event.kind, &event.component_id, event.timestamp);
            metrics.events_processed
        };

        if events_processed >= shared.config.max_events {
            complete(shared, event.timestamp);
            return;
        }
    }
}

fn dispatch(shared: &Shared, event: &Event) {
    let reactions = {
        let mut components = shared
            .components
            .write()
            .expect("component registry lock poisoned");
        match components.get_mut(&event.component_id) {
            Some(component) => {
                let ctx = SimContext::new(event.timestamp, shared.cancel.clone());
                component.handle_event(&ctx, event)
            }
            None => Vec::new(),
        }
    };

    for reaction in reactions {
        if reaction.timestamp < event.timestamp {
            log::error!(
                "Dropping reaction {} scheduled before its cause ({} < {})",
                reaction.id,
                reaction.timestamp,
                event.timestamp
            );
            let mut metrics = shared.metrics.lock().expect("metrics lock poisoned");
            metrics.error_count += 1;
            continue;
        }
        shared.queue.enqueue(reaction);
    }

    let mut handlers = shared.handlers.lock().expect("handler registry lock poisoned");
    if let Some(handlers) = handlers.get_mut(&event.kind) {
        for handler in handlers.iter_mut() {
            handler(event);
        }
    }
}

fn complete(shared: &Shared, time: f64) {
    let mut clock = shared.clock.lock().expect("clock lock poisoned");
    clock.state = SimulationState::Completed;
    let mut metrics = shared.metrics.lock().expect("metrics lock poisoned");
    metrics.end_time = Some(SystemTime::now());
    log::info!(
        "Simulation completed at time {time} after {} events",
        metrics.events_processed
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::components::GenericService;
    use crate::Properties;

    fn service(id: &str, max_concurrency: u64) -> Box<dyn Component> {
        let mut service = GenericService::new(id);
        service
            .initialize(
                &Properties::new()
                    .with("processing_time", 1.0)
                    .with("failure_rate", 0.0)
                    .with("max_concurrency", max_concurrency),
            )
            .unwrap();
        Box::new(service)
    }

    fn engine(max_simulation_time: f64) -> SimulationEngine {
        SimulationEngine::new(EngineConfig {
            max_simulation_time,
            ..EngineConfig::default()
        })
    }

    fn arrival(id: &str, time: f64) -> Event {
        Event::new(id, time, EventKind::RequestArrival, "svc")
    }

    #[test]
    fn test_initial_state() {
        let engine = engine(10.0);
        assert_eq!(engine.state(), SimulationState::Initialized);
        assert_eq!(engine.current_time(), 0.0);
    }

    #[test]
    fn test_run_to_completion_processes_events() {
        let mut engine = engine(10.0);
        engine.add_component(service("svc", 4)).unwrap();
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.schedule_event(arrival("r2", 2.0)).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.state(), SimulationState::Completed);
        let metrics = engine.metrics();
        // Two arrivals, two processed, two completed.
        assert_eq!(metrics.events_processed, 6);
        assert_eq!(metrics.event_kind_stats[&EventKind::RequestArrival], 2);
        assert_eq!(metrics.event_kind_stats[&EventKind::RequestCompleted], 2);
    }

    #[test]
    fn test_temporal_violation_leaves_queue_unchanged() {
        let mut engine = engine(3.0);
        engine.add_component(service("svc", 4)).unwrap();
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.run().unwrap();
        assert!(engine.current_time() >= 3.0);
        let before = engine.queue_stats().size;
        let result = engine.schedule_event(arrival("late", 0.5));
        assert!(matches!(
            result,
            Err(ScheduleError::TemporalViolation { .. })
        ));
        assert_eq!(engine.queue_stats().size, before);
    }

    #[test]
    fn test_add_remove_component_guards() {
        // Unbounded run time keeps the worker alive until `stop`.
        let mut engine = engine(f64::INFINITY);
        engine.add_component(service("svc", 4)).unwrap();
        engine.start().unwrap();
        assert!(matches!(
            engine.add_component(service("other", 4)),
            Err(EngineError::Running { .. })
        ));
        assert!(matches!(
            engine.remove_component("svc"),
            Err(EngineError::Running { .. })
        ));
        engine.stop().unwrap();
        assert!(engine.remove_component("svc").is_ok());
        assert!(matches!(
            engine.remove_component("svc"),
            Err(EngineError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_remove_component_purges_queue() {
        let engine = engine(10.0);
        engine.add_component(service("svc", 4)).unwrap();
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.schedule_event(arrival("r2", 2.0)).unwrap();
        engine.remove_component("svc").unwrap();
        assert_eq!(engine.queue_stats().size, 0);
    }

    #[test]
    fn test_pause_resume_guards() {
        let mut engine = engine(f64::INFINITY);
        assert!(matches!(engine.pause(), Err(EngineError::NotRunning)));
        assert!(matches!(engine.resume(), Err(EngineError::NotPaused)));
        engine.start().unwrap();
        engine.pause().unwrap();
        assert_eq!(engine.state(), SimulationState::Paused);
        engine.resume().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), SimulationState::Stopped);
        assert!(engine.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut engine = engine(5.0);
        engine.add_component(service("svc", 4)).unwrap();
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.run().unwrap();
        engine.schedule_event(arrival("r2", 6.0)).unwrap();
        engine.reset().unwrap();
        assert_eq!(engine.state(), SimulationState::Initialized);
        assert_eq!(engine.current_time(), 0.0);
        assert_eq!(engine.queue_stats().size, 0);
        assert_eq!(engine.metrics().events_processed, 0);
    }

    #[test]
    fn test_max_events_completes_run() {
        let mut engine = SimulationEngine::new(EngineConfig {
            max_simulation_time: 1000.0,
            max_events: 1,
            ..EngineConfig::default()
        });
        engine.add_component(service("svc", 4)).unwrap();
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.schedule_event(arrival("r2", 2.0)).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.state(), SimulationState::Completed);
        assert_eq!(engine.metrics().events_processed, 1);
    }

    #[test]
    fn test_handler_and_listener_see_events_in_order() {
        use std::sync::mpsc;

        struct Recorder(mpsc::Sender<String>);
        impl EventListener for Recorder {
            fn on_event(&mut self, event: &Event) {
                let _ = self.0.send(event.id.clone());
            }
        }

        let mut engine = engine(10.0);
        engine.add_component(service("svc", 4)).unwrap();
        let (sender, receiver) = mpsc::channel();
        engine.add_listener(Box::new(Recorder(sender)));
        let (handled_sender, handled_receiver) = mpsc::channel();
        engine.register_handler(EventKind::RequestArrival, move |event| {
            let _ = handled_sender.send(event.id.clone());
        });
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.schedule_event(arrival("r2", 2.0)).unwrap();
        engine.run().unwrap();

        let seen: Vec<_> = receiver.try_iter().collect();
        assert_eq!(seen.first().map(String::as_str), Some("r1"));
        assert_eq!(seen.len(), 6);
        let handled: Vec<_> = handled_receiver.try_iter().collect();
        assert_eq!(handled, ["r1", "r2"]);
    }

    #[test]
    fn test_panic_in_handler_transitions_to_error() {
        let mut engine = engine(10.0);
        engine.add_component(service("svc", 4)).unwrap();
        engine.register_handler(EventKind::RequestArrival, |_| panic!("boom"));
        engine.schedule_event(arrival("r1", 1.0)).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.state(), SimulationState::Error);
        // Metrics stay readable after the failure.
        assert_eq!(engine.metrics().error_count, 0);
    }

    #[test]
    fn test_time_is_monotone_across_dispatches() {
        use std::sync::mpsc;

        struct Times(mpsc::Sender<f64>);
        impl EventListener for Times {
            fn on_event(&mut self, event: &Event) {
                let _ = self.0.send(event.timestamp);
            }
        }

        let mut engine = engine(20.0);
        engine.add_component(service("svc", 1)).unwrap();
        let (sender, receiver) = mpsc::channel();
        engine.add_listener(Box::new(Times(sender)));
        for n in 0..5 {
            engine
                .schedule_event(arrival(&format!("r{n}"), f64::from(n)))
                .unwrap();
        }
        engine.run().unwrap();
        let times: Vec<f64> = receiver.try_iter().collect();
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
