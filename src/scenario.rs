use std::fs::File;
use std::path::Path;

use eyre::WrapErr;
use serde::Deserialize;

use crate::{ComponentFactory, ComponentKind, EngineConfig, Event, Properties, SimulationEngine};

/// A component declaration in a scenario file.
#[derive(Debug, Deserialize)]
pub struct ComponentSpec {
    /// Kind tag, e.g. `generic_service`.
    pub kind: ComponentKind,
    /// Unique component id.
    pub id: String,
    /// Per-kind configuration.
    #[serde(default)]
    pub properties: Properties,
}

/// A self-contained simulation description: engine configuration, the
/// component topology, and the initial events that seed the run.
///
/// # Example
///
/// ```json
/// {
///     "engine": {"max_simulation_time": 100.0},
///     "components": [
///         {"kind": "generic_service", "id": "svc",
///          "properties": {"processing_time": 1.0, "max_concurrency": 4}}
///     ],
///     "events": [
///         {"id": "r1", "timestamp": 1.0, "type": "request_arrival",
///          "component_id": "svc", "data": {"request_id": "r1"}}
///     ]
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Engine configuration; defaults apply for missing fields.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Components to register.
    pub components: Vec<ComponentSpec>,
    /// Events scheduled before the run starts.
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Scenario {
    /// Reads a scenario from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .wrap_err_with(|| format!("unable to open scenario file: {}", path.display()))?;
        serde_json::from_reader(file)
            .wrap_err_with(|| format!("unable to parse scenario file: {}", path.display()))
    }

    /// Builds an engine with all components registered and the initial
    /// events scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error when a component fails validation or an initial
    /// event violates the temporal constraint.
    pub fn build(&self) -> eyre::Result<SimulationEngine> {
        let engine = SimulationEngine::new(self.engine.clone());
        for spec in &self.components {
            let component = ComponentFactory::create(spec.kind, &spec.id, &spec.properties)
                .wrap_err_with(|| format!("invalid component: {}", spec.id))?;
            engine.add_component(component)?;
        }
        for event in &self.events {
            engine
                .schedule_event(event.clone())
                .wrap_err_with(|| format!("invalid initial event: {}", event.id))?;
        }
        Ok(engine)
    }
}
