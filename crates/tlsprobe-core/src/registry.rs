//! Static name to constructor mapping for capture modules

use crate::error::{CaptureError, CaptureResult};
use crate::module::CaptureModule;
use std::collections::BTreeMap;

/// Builds a fresh module instance
pub type ModuleFactory = Box<dyn Fn() -> Box<dyn CaptureModule> + Send + Sync>;

/// Registry of available capture modules
///
/// Built once at session start and handed to the orchestrator.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. A later registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn CaptureModule> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct a new instance of `name`
    pub fn create(&self, name: &str) -> CaptureResult<Box<dyn CaptureModule>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| CaptureError::UnknownModule(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
