//! Driver registry.
//!
//! Maps a config-declared driver name to an adapter constructor. Each
//! concrete driver is a separate implementation unit registered here;
//! provider configs select one by name.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::adapter::Adapter;
use crate::config::ProviderConfig;
use crate::mock::MockAdapter;

type AdapterFactory = Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Adapter>> + Send + Sync>;

/// Registry of adapter constructors keyed by driver name.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in drivers registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("mock", |provider| {
            Ok(Arc::new(MockAdapter::new(&provider.name)) as Arc<dyn Adapter>)
        });
        registry
    }

    /// Register (or replace) a driver constructor.
    pub fn register<F>(&mut self, driver: &str, factory: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Adapter>> + Send + Sync + 'static,
    {
        self.factories.insert(driver.to_string(), Arc::new(factory));
    }

    /// Build the adapter for a provider config.
    pub fn build(&self, provider: &ProviderConfig) -> Result<Arc<dyn Adapter>> {
        let Some(factory) = self.factories.get(&provider.driver) else {
            bail!(
                "unknown driver {} for provider {}",
                provider.driver,
                provider.name
            );
        };
        factory(provider)
    }
}
