//! Engine family registry.
//!
//! A plain name to constructor table, populated once at start. Family names
//! are matched exactly.

use super::{EngineClient, EngineContext, HiveEngine, PrestoEngine, SqlxEngine};
use crate::config::EngineConfiguration;
use crate::error::{RelayError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a client for one engine configuration.
pub type EngineConstructor = Arc<
    dyn Fn(&EngineConfiguration, &EngineContext) -> Result<Arc<dyn EngineClient>> + Send + Sync,
>;

/// Table of known engine families.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    constructors: BTreeMap<String, EngineConstructor>,
}

impl EngineRegistry {
    /// Creates a registry with no families.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in family.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for family in PrestoEngine::FAMILIES {
            registry.register(family, |config, context| {
                Ok(Arc::new(PrestoEngine::new(config, context)?) as Arc<dyn EngineClient>)
            });
        }
        registry.register(HiveEngine::FAMILY, |config, context| {
            Ok(Arc::new(HiveEngine::new(config, context)?) as Arc<dyn EngineClient>)
        });
        for family in SqlxEngine::FAMILIES {
            registry.register(family, |config, context| {
                Ok(Arc::new(SqlxEngine::new(config, context)?) as Arc<dyn EngineClient>)
            });
        }
        registry
    }

    /// Registers (or replaces) a family constructor.
    pub fn register<F>(&mut self, family: &str, constructor: F)
    where
        F: Fn(&EngineConfiguration, &EngineContext) -> Result<Arc<dyn EngineClient>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(family.to_string(), Arc::new(constructor));
    }

    /// Returns the registered family names in sorted order.
    pub fn families(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Returns true if the family is known.
    pub fn contains(&self, family: &str) -> bool {
        self.constructors.contains_key(family)
    }

    /// Creates a client for the configuration's family.
    pub fn create(
        &self,
        config: &EngineConfiguration,
        context: &EngineContext,
    ) -> Result<Arc<dyn EngineClient>> {
        let constructor = self.constructors.get(&config.family).ok_or_else(|| {
            RelayError::config(format!(
                "Unknown engine family '{}' for engine '{}'",
                config.family, config.name
            ))
        })?;
        debug!("Creating '{}' client for engine '{}'", config.family, config.name);
        constructor(config, context)
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("families", &self.families())
            .finish()
    }
}
