//! Table store factory with automatic feature-based registration.
use crate::data::storage::{JsonTableStore, TableStore};
use crate::error::BufferError;
use std::collections::HashMap;

#[cfg(feature = "storage_hdf5")]
use crate::data::storage::Hdf5TableStore;

type StoreFactory = Box<dyn Fn() -> Box<dyn TableStore> + Send + Sync>;

/// Backends that exist but may not be compiled in.
const KNOWN_BACKENDS: &[(&str, &str)] = &[("hdf5", "storage_hdf5")];

/// Registry for table store factories with automatic feature detection.
///
/// The JSON backend is always registered; the HDF5 backend only when the
/// `storage_hdf5` feature is enabled.
///
/// # Examples
///
/// ```
/// use daq_buffer::data::storage_factory::TableStoreRegistry;
///
/// let registry = TableStoreRegistry::new();
/// assert!(registry.is_available("json"));
///
/// let store = registry.create("json")?;
/// assert_eq!(store.extension(), "json");
/// # Ok::<(), daq_buffer::error::BufferError>(())
/// ```
pub struct TableStoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl Default for TableStoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStoreRegistry {
    /// Creates a new registry and registers all compiled-in backends.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("json", || Box::new(JsonTableStore::new()));

        #[cfg(feature = "storage_hdf5")]
        registry.register("hdf5", || Box::new(Hdf5TableStore::new()));

        registry
    }

    /// Registers a custom backend.
    pub fn register<F>(&mut self, backend: &str, factory: F)
    where
        F: Fn() -> Box<dyn TableStore> + Send + Sync + 'static,
    {
        self.factories.insert(backend.to_string(), Box::new(factory));
    }

    /// Creates a fresh store for one recording session.
    ///
    /// # Errors
    ///
    /// - [`BufferError::FeatureNotEnabled`] for a known backend that was not
    ///   compiled in
    /// - [`BufferError::Config`] for an unknown backend name
    pub fn create(&self, backend: &str) -> Result<Box<dyn TableStore>, BufferError> {
        if let Some(factory) = self.factories.get(backend) {
            return Ok(factory());
        }
        if let Some((_, feature)) = KNOWN_BACKENDS.iter().find(|(name, _)| *name == backend) {
            return Err(BufferError::FeatureNotEnabled((*feature).to_string()));
        }
        Err(BufferError::config(format!(
            "Unsupported storage backend: '{}'. Available backends: [{}]",
            backend,
            self.list_backends().join(", ")
        )))
    }

    /// Sorted names of the registered backends.
    pub fn list_backends(&self) -> Vec<String> {
        let mut backends: Vec<String> = self.factories.keys().cloned().collect();
        backends.sort();
        backends
    }

    /// Whether `backend` can be created.
    pub fn is_available(&self, backend: &str) -> bool {
        self.factories.contains_key(backend)
    }
}
