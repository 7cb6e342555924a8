//! The component registry: named factories for building components from
//! configuration.
//!
//! Registration is an explicit, instance-scoped operation; there is no
//! process-global table. An application builds a registry, registers the
//! factories it ships, and hands the registry to [`Pipeline::from_config`]
//! (`pipeline` module) or [`Pipeline::load_from`] (`persistence` module).
//!
//! [`Pipeline::from_config`]: crate::pipeline::Pipeline::from_config
//! [`Pipeline::load_from`]: crate::pipeline::Pipeline::load_from

use indexmap::IndexMap;

use crate::component::Component;
use crate::core::error::Result;
use crate::{config_error, PipelineError};

/// Factory building a component from its JSON configuration block.
pub type ComponentFactory = Box<dyn Fn(&serde_json::Value) -> Result<Component> + Send + Sync>;

/// An explicit, instance-scoped table of component factories.
#[derive(Default)]
pub struct ComponentRegistry {
    factories: IndexMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. Registering a name twice is an
    /// error rather than a silent overwrite.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&serde_json::Value) -> Result<Component> + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(PipelineError::AlreadyExists {
                resource: "Component factory".to_string(),
                id: name,
            });
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Build a component from the named factory and its configuration.
    pub fn create(&self, name: &str, config: &serde_json::Value) -> Result<Component> {
        let factory = self.factories.get(name).ok_or_else(|| {
            config_error!(
                "unknown component factory '{}'; registered factories: [{}]",
                name,
                self.names().join(", ")
            )
        })?;
        factory(config)
    }

    /// Whether a factory is registered under this name.
    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered factory names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("factories", &self.names())
            .finish()
    }
}
