//! Selecting a storage backend by scheme name.
//!
//! Backends are compiled in through cargo features and registered under the
//! scheme name operators put in configuration. Lookup happens once at
//! startup; the resulting [`Storage`] is what request handlers hold.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use serde_json::Value;

use registry_storage_driver::{StorageDriver, StorageError, StorageErrorKind};

use crate::Storage;

const REGISTRY_NAME: &str = "registry";

/// Backend-specific configuration. The contract imposes no schema on it.
pub type DriverConfig = serde_json::Map<String, Value>;

/// Constructs a backend from its options.
pub type DriverConstructor = fn(&DriverOptions) -> Result<Box<dyn StorageDriver>, StorageError>;

/// What a backend is constructed from.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Where the backend keeps its data, if it has a notion of a root.
    pub root: Option<Utf8PathBuf>,

    /// Backend-specific settings.
    pub config: DriverConfig,
}

impl DriverOptions {
    /// Create options with a root path and no extra settings.
    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            config: DriverConfig::new(),
        }
    }

    /// Deserialize the backend-specific settings into the backend's own
    /// options type. Keys the type does not name are ignored.
    pub fn parse<T>(&self, engine: &'static str) -> Result<T, StorageError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|err| {
            StorageError::builder(engine, StorageErrorKind::InvalidRequest, err)
                .context("driver options")
                .build()
        })
    }
}

/// The source of a [`StorageErrorKind::NotImplemented`] error for a scheme
/// nobody registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "storage driver {name} is not installed, enable its feature or check your configuration; \
     available drivers: {}",
    .available.join(", ")
)]
pub struct UnknownDriver {
    /// The scheme that was requested.
    pub name: String,

    /// The schemes that are registered.
    pub available: Vec<String>,
}

/// A backend constructor with its scheme name bound.
#[derive(Debug, Clone)]
pub struct DriverFactory {
    scheme: String,
    constructor: DriverConstructor,
}

impl DriverFactory {
    /// The scheme this factory was fetched under.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Construct the backend.
    #[tracing::instrument(skip(self, options), fields(scheme = %self.scheme))]
    pub fn open(&self, options: DriverOptions) -> Result<Storage, StorageError> {
        let driver = (self.constructor)(&options)?;
        tracing::debug!(driver = driver.name(), "opened storage driver");
        Ok(Storage::with_scheme(self.scheme.clone(), driver))
    }
}

/// Maps scheme names to backend constructors.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The backends compiled into this build.
    pub fn builtin() -> &'static DriverRegistry {
        static BUILTIN: OnceLock<DriverRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            let mut registry = DriverRegistry::new();
            registry.register("memory", |options| {
                Ok(Box::new(crate::MemoryDriver::from_options(options)?))
            });
            #[cfg(feature = "local")]
            registry.register("local", |options| {
                Ok(Box::new(crate::LocalDriver::from_options(options)?))
            });
            #[cfg(feature = "tmp")]
            registry.register("tmp", |options| {
                Ok(Box::new(crate::TempDriver::from_options(options)?))
            });
            registry
        })
    }

    /// Register a backend under `scheme`, replacing any previous one.
    pub fn register(
        &mut self,
        scheme: impl Into<String>,
        constructor: DriverConstructor,
    ) -> &mut Self {
        self.drivers.insert(scheme.into(), constructor);
        self
    }

    /// The registered scheme names, sorted. Nothing is constructed.
    pub fn available(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// Look up the backend registered under `scheme`.
    pub fn fetch(&self, scheme: &str) -> Result<DriverFactory, StorageError> {
        let Some(constructor) = self.drivers.get(scheme) else {
            let unknown = UnknownDriver {
                name: scheme.to_owned(),
                available: self.available(),
            };
            tracing::warn!(%scheme, available = ?unknown.available, "storage driver not found");
            return Err(
                StorageError::builder(REGISTRY_NAME, StorageErrorKind::NotImplemented, unknown)
                    .context("fetch driver")
                    .build(),
            );
        };

        tracing::debug!(%scheme, "found storage driver");
        Ok(DriverFactory {
            scheme: scheme.to_owned(),
            constructor: *constructor,
        })
    }
}

/// Look up a backend in the [builtin](DriverRegistry::builtin) registry.
pub fn fetch(scheme: &str) -> Result<DriverFactory, StorageError> {
    DriverRegistry::builtin().fetch(scheme)
}

/// The schemes available in the [builtin](DriverRegistry::builtin) registry.
pub fn available() -> Vec<String> {
    DriverRegistry::builtin().available()
}
