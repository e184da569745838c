//! # Registry storage backends
//!
//! Configuration, selection and unification of the registry storage backends.
//! A [`Storage`] is obtained once at startup, either from a [`StorageConfig`]
//! or by [`fetch`]ing a scheme from the [`DriverRegistry`], and then cloned into
//! whatever needs to reach the backend.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::BoxStream;
use http::Uri;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;
pub(crate) mod memory;
pub mod registry;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryDriver;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use registry::{
    available, fetch, DriverConfig, DriverFactory, DriverOptions, DriverRegistry, UnknownDriver,
};

#[doc(inline)]
pub use registry_storage_driver::{
    decode, encode, enumerate, paths, ByteRange, ByteStream, Capabilities, StorageDriver,
    StorageDriverExt, StorageError, StorageErrorKind, CHUNK_SIZE,
};

/// Join `path` onto a configured redirect base.
pub(crate) fn redirect(base: &str, path: &Utf8Path) -> Option<Uri> {
    let url = format!("{}/{}", base.trim_end_matches('/'), path);
    match url.parse() {
        Ok(uri) => Some(uri),
        Err(error) => {
            tracing::warn!(%url, %error, "invalid redirect url");
            None
        }
    }
}

/// Storage configuration, as it appears in the registry's config file.
///
/// ```
/// let config: registry_storage::StorageConfig = serde_json::from_str(
///     r#"{"driver": "memory", "supports_bytes_range": false}"#,
/// ).unwrap();
/// assert_eq!(config.driver, "memory");
/// assert!(config.options.contains_key("supports_bytes_range"));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Scheme name of the backend.
    pub driver: String,

    /// Where the backend keeps its data.
    #[serde(default)]
    pub root: Option<Utf8PathBuf>,

    /// Any other keys, passed to the backend untouched.
    #[serde(flatten)]
    pub options: DriverConfig,
}

impl StorageConfig {
    /// Resolve the configured backend through the builtin registry and open it.
    #[tracing::instrument(skip(self), fields(driver = %self.driver))]
    pub fn build(self) -> Result<Storage, StorageError> {
        fetch(&self.driver)?.open(DriverOptions {
            root: self.root,
            config: self.options,
        })
    }
}

/// Log backend failures which are not contract outcomes. `NotFound` and
/// friends are routine for callers and stay quiet.
fn observe<T>(result: Result<T, StorageError>) -> Result<T, StorageError> {
    if let Err(error) = &result {
        if !error.kind().is_contract() {
            tracing::warn!(
                engine = error.engine(),
                kind = %error.kind(),
                %error,
                "storage backend failure"
            );
        }
    }
    result
}

pub(crate) type ArcDriver = Arc<dyn StorageDriver>;

/// A handle to the bound storage backend.
///
/// Cheap to clone; every clone talks to the same backend. `Storage` is itself a
/// [`StorageDriver`], so the convenience operations of [`StorageDriverExt`] and
/// the [`enumerate`] scans all work on it directly.
#[derive(Debug, Clone)]
pub struct Storage {
    scheme: Arc<str>,
    driver: ArcDriver,
}

impl Storage {
    /// Wrap a driver, using its engine name as the scheme.
    pub fn new<D: StorageDriver + 'static>(driver: D) -> Self {
        let scheme = driver.name().into();
        Self {
            scheme,
            driver: Arc::new(driver),
        }
    }

    pub(crate) fn with_scheme(scheme: String, driver: Box<dyn StorageDriver>) -> Self {
        Self {
            scheme: scheme.into(),
            driver: driver.into(),
        }
    }

    /// The name of the storage engine.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The scheme this storage was selected under.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Every image id in storage.
    pub fn images(&self) -> BoxStream<'_, Result<String, StorageError>> {
        enumerate::iterate_images(self)
    }

    /// Every `(namespace, repository)` pair in storage.
    pub fn repositories(&self) -> BoxStream<'_, Result<(String, String), StorageError>> {
        enumerate::iterate_repositories(self)
    }

    /// Every `(tag, image_id)` pair of one repository.
    pub fn tags(
        &self,
        namespace: &str,
        repository: &str,
    ) -> BoxStream<'_, Result<(String, String), StorageError>> {
        enumerate::iterate_tags(self, namespace, repository)
    }
}

#[async_trait::async_trait]
impl StorageDriver for Storage {
    fn name(&self) -> &'static str {
        self.driver.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        observe(self.driver.get_content(path).await)
    }

    #[tracing::instrument(skip(self, content), fields(driver = self.driver.name(), size = content.len()))]
    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        observe(self.driver.put_content(path, content).await)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream<'static>, StorageError> {
        tracing::trace!(%path, "streaming from storage");
        observe(self.driver.stream_read(path, range).await)
    }

    #[tracing::instrument(skip(self, content), fields(driver = self.driver.name()))]
    async fn stream_write(
        &self,
        path: &Utf8Path,
        content: ByteStream<'_>,
    ) -> Result<(), StorageError> {
        tracing::trace!(%path, "streaming to storage");
        observe(self.driver.stream_write(path, content).await)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn list_directory(
        &self,
        path: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        observe(self.driver.list_directory(path).await)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        observe(self.driver.remove(path).await)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        observe(self.driver.get_size(path).await)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        observe(self.driver.exists(path).await)
    }

    fn content_redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
        self.driver.content_redirect_url(path)
    }

    fn content_sendfile_uri(&self, path: &Utf8Path) -> Option<Uri> {
        self.driver.content_sendfile_uri(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_passes_unknown_keys_to_backend() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "driver": "memory",
            "redirect_base": "https://cdn.example.com",
        }))
        .unwrap();
        assert_eq!(config.driver, "memory");
        assert!(config.root.is_none());

        let storage = config.build().unwrap();
        assert_eq!(storage.scheme(), "memory");
        assert!(storage.capabilities().supports_redirect);
        assert_eq!(
            storage
                .redirect_url(Utf8Path::new("images/abc/layer"))
                .unwrap(),
            "https://cdn.example.com/images/abc/layer"
        );
    }

    #[test]
    fn config_with_unknown_driver_fails() {
        let config: StorageConfig =
            serde_json::from_value(serde_json::json!({ "driver": "s3" })).unwrap();
        let err = config.build().unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotImplemented);
    }

    #[cfg(feature = "local")]
    #[test]
    fn config_reads_root() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "driver": "local",
            "root": "/var/lib/registry",
        }))
        .unwrap();
        assert_eq!(config.root.as_deref(), Some(Utf8Path::new("/var/lib/registry")));
        assert!(config.options.is_empty());
    }

    #[cfg(feature = "local")]
    #[test]
    fn config_enables_sendfile() {
        let dir = tempfile::tempdir().unwrap();
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "driver": "local",
            "root": dir.path().to_str().unwrap(),
            "sendfile_base": "/_internal/registry",
        }))
        .unwrap();
        let storage = config.build().unwrap();
        assert_eq!(
            storage.image_sendfile_uri("abc123").unwrap(),
            "/_internal/registry/images/abc123/layer"
        );
        assert!(storage.image_redirect_url("abc123").is_none());
    }

    #[test]
    fn observe_passes_results_through() {
        let err = observe::<()>(Err(StorageError::new(
            "memory",
            StorageErrorKind::Io,
            "disk on fire",
        )))
        .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Io);
        assert_eq!(observe(Ok::<_, StorageError>(3)).unwrap(), 3);
    }

    #[test]
    fn redirect_joins_base_and_path() {
        let uri = redirect("https://cdn.example.com/", Utf8Path::new("images/a/layer")).unwrap();
        assert_eq!(uri, "https://cdn.example.com/images/a/layer");
        assert!(redirect("not a url", Utf8Path::new("x")).is_none());
    }
}
