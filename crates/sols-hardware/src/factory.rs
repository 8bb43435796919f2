//! Driver factory lookup table.

use parking_lot::RwLock;
use sols_core::driver::DriverFactory;
use sols_driver_mock::FactoryRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Driver factories keyed by driver type.
#[derive(Default)]
pub struct FactoryTable {
    factories: RwLock<BTreeMap<&'static str, Arc<dyn DriverFactory>>>,
}

impl FactoryTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every mock driver registered.
    pub fn with_mock_drivers() -> Self {
        let table = Self::new();
        sols_driver_mock::register_all(&table);
        table
    }

    /// Factory for a driver type.
    pub fn get(&self, driver_type: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.read().get(driver_type).cloned()
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        self.factories.read().keys().copied().collect()
    }
}

impl FactoryRegistry for FactoryTable {
    fn register_factory(&self, factory: Box<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        if self
            .factories
            .write()
            .insert(driver_type, Arc::from(factory))
            .is_some()
        {
            tracing::warn!("Driver factory '{}' replaced", driver_type);
        }
    }
}

impl std::fmt::Debug for FactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryTable")
            .field("driver_types", &self.driver_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_drivers_registered() {
        let table = FactoryTable::with_mock_drivers();
        assert_eq!(table.driver_types().len(), 7);
        assert!(table.get("mock_galvo").is_some());
        assert!(table.get("pvcam").is_none());
    }
}
