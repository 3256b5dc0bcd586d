use std::str::FromStr;

use strum::IntoEnumIterator;

use crate::components::{
    ApiGateway, Cache, Database, GenericService, LoadBalancer, MessageQueue,
};
use crate::{Component, ComponentKind, ConfigError, Properties};

/// Constructs and validates components from property maps.
///
/// Creation dispatches on the kind tag, initializes the component from the
/// given properties and then validates it; any failure is propagated and no
/// component is returned. Property schemas are per kind: numeric ranges are
/// checked at initialization and enumerations (such as the load-balancing
/// algorithm) reject unknown values.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComponentFactory;

impl ComponentFactory {
    /// Creates a component of the given kind.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when initialization or validation fails.
    pub fn create(
        kind: ComponentKind,
        id: &str,
        properties: &Properties,
    ) -> Result<Box<dyn Component>, ConfigError> {
        let mut component: Box<dyn Component> = match kind {
            ComponentKind::GenericService => Box::new(GenericService::new(id)),
            ComponentKind::Database => Box::new(Database::new(id)),
            ComponentKind::MessageQueue => Box::new(MessageQueue::new(id)),
            ComponentKind::LoadBalancer => Box::new(LoadBalancer::new(id)),
            ComponentKind::Cache => Box::new(Cache::new(id)),
            ComponentKind::ApiGateway => Box::new(ApiGateway::new(id)),
        };
        component.initialize(properties)?;
        component.validate()?;
        Ok(component)
    }

    /// Creates a component from a string kind tag.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedKind`] for unknown tags, otherwise
    /// as [`create`](Self::create).
    pub fn create_from_tag(
        kind: &str,
        id: &str,
        properties: &Properties,
    ) -> Result<Box<dyn Component>, ConfigError> {
        let kind = ComponentKind::from_str(kind)
            .map_err(|_| ConfigError::UnsupportedKind(kind.to_string()))?;
        Self::create(kind, id, properties)
    }

    /// All kinds the factory can construct.
    #[must_use]
    pub fn supported_kinds() -> Vec<ComponentKind> {
        ComponentKind::iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_creates_every_kind() {
        for kind in ComponentFactory::supported_kinds() {
            let component = ComponentFactory::create(kind, "c1", &Properties::new()).unwrap();
            assert_eq!(component.kind(), kind);
            assert_eq!(component.id(), "c1");
        }
    }

    #[test]
    fn test_properties_survive_creation() {
        let properties = Properties::new()
            .with("processing_time", 2.0)
            .with("failure_rate", 0.5)
            .with("max_concurrency", 7);
        let component =
            ComponentFactory::create(ComponentKind::GenericService, "svc", &properties).unwrap();
        assert_eq!(component.properties(), &properties);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            ComponentFactory::create_from_tag("mainframe", "c1", &Properties::new()),
            Err(ConfigError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn test_invalid_properties_rejected() {
        let properties = Properties::new().with("failure_rate", 1.5);
        assert!(ComponentFactory::create(ComponentKind::Database, "db", &properties).is_err());
        let properties = Properties::new().with("algorithm", "fastest");
        assert!(
            ComponentFactory::create(ComponentKind::LoadBalancer, "lb", &properties).is_err()
        );
        assert!(
            ComponentFactory::create(ComponentKind::Cache, "", &Properties::new()).is_err()
        );
    }

    #[test]
    fn test_tag_round_trip() {
        let component =
            ComponentFactory::create_from_tag("message_queue", "mq", &Properties::new()).unwrap();
        assert_eq!(component.kind(), ComponentKind::MessageQueue);
    }
}
