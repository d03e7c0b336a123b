//! Step-type registry.
//!
//! Engines are registered once at startup under a type string. Resolving
//! an unregistered type is a configuration error; there is no dynamic
//! loading or probing.

mod context;
mod engine;

pub use context::StepContext;
pub use engine::{StepConfig, StepEngine, StepResult, StepStatus};

use crate::errors::{ConfigError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an engine instance.
pub type EngineFactory = Arc<dyn Fn() -> Arc<dyn StepEngine> + Send + Sync>;

/// Maps step-type identifiers to engine factories.
#[derive(Default)]
pub struct EngineRegistry {
    factories: RwLock<HashMap<String, EngineFactory>>,
}

impl EngineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for `step_type`.
    pub fn register_factory(&self, step_type: impl Into<String>, factory: EngineFactory) {
        let step_type = step_type.into();
        if self.factories.write().insert(step_type.clone(), factory).is_some() {
            tracing::warn!(step_type = %step_type, "Replaced registered step engine");
        }
    }

    /// Registers a shared engine instance.
    pub fn register(&self, step_type: impl Into<String>, engine: Arc<dyn StepEngine>) {
        self.register_factory(step_type, Arc::new(move || engine.clone()));
    }

    /// Builds the engine for `step_type`.
    pub fn resolve(&self, step_type: &str) -> Result<Arc<dyn StepEngine>> {
        let factories = self.factories.read();
        let factory = factories.get(step_type).ok_or_else(|| {
            let mut known: Vec<&str> = factories.keys().map(String::as_str).collect();
            known.sort_unstable();
            ConfigError::new(format!(
                "unknown step type '{step_type}' (registered: {})",
                known.join(", ")
            ))
            .with_field("type")
        })?;
        Ok(factory())
    }

    /// Returns true if `step_type` is registered.
    #[must_use]
    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.read().contains_key(step_type)
    }

    /// Registered step types, sorted.
    #[must_use]
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}
