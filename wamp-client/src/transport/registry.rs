use std::sync::Arc;

use anyhow::Result;

use crate::{
    core::hash::HashMap,
    transport::{
        transport::{
            TransportConfig,
            TransportFactory,
        },
        web_socket_transport::WebSocketTransportFactory,
    },
};

/// A constructor that builds a [`TransportFactory`] from a transport entry.
pub type TransportConstructor =
    Arc<dyn Fn(&TransportConfig) -> Result<Box<dyn TransportFactory>> + Send + Sync>;

/// Maps transport type names to constructors.
///
/// The default registry knows the `websocket` transport type.
#[derive(Clone)]
pub struct TransportRegistry {
    constructors: HashMap<String, TransportConstructor>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::default(),
        }
    }

    /// Registers a constructor for a transport type, replacing any previous one.
    pub fn register<S, F>(&mut self, transport_type: S, constructor: F)
    where
        S: Into<String>,
        F: Fn(&TransportConfig) -> Result<Box<dyn TransportFactory>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(transport_type.into(), Arc::new(constructor));
    }

    /// Looks up the constructor for a transport type.
    pub fn get(&self, transport_type: &str) -> Option<TransportConstructor> {
        self.constructors.get(transport_type).cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("websocket", |config| {
            Ok(Box::new(WebSocketTransportFactory::new(config)?))
        });
        registry
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod registry_test {
    use crate::transport::{
        registry::TransportRegistry,
        transport::TransportConfig,
    };

    #[test]
    fn default_registry_builds_web_socket_factories() {
        let registry = TransportRegistry::default();
        let constructor = registry.get("websocket").unwrap();
        let factory =
            constructor(&TransportConfig::new("websocket", "ws://127.0.0.1:9/ws")).unwrap();
        assert_eq!(factory.transport_type(), "websocket");
        assert!(registry.get("longpoll").is_none());
    }

    #[test]
    fn construction_failures_are_reported_per_entry() {
        let registry = TransportRegistry::default();
        let constructor = registry.get("websocket").unwrap();
        assert_matches::assert_matches!(constructor(&TransportConfig {
            transport_type: "websocket".to_owned(),
            ..Default::default()
        }), Err(err) => {
            assert!(err.to_string().contains("url"));
        });
    }

    #[test]
    fn later_registrations_replace_earlier_ones() {
        let mut registry = TransportRegistry::new();
        assert!(registry.get("websocket").is_none());
        registry.register("websocket", |_| Err(anyhow::Error::msg("disabled")));
        let constructor = registry.get("websocket").unwrap();
        assert!(constructor(&TransportConfig::default()).is_err());
    }
}
