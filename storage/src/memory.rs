use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use futures::TryStreamExt;
use http::Uri;
use serde::Deserialize;
use tokio::sync::RwLock;

use registry_storage_driver::{
    chunked, ByteRange, ByteStream, Capabilities, StorageDriver, StorageError,
};

use crate::registry::DriverOptions;

const MEMORY_STORAGE_NAME: &str = "memory";

/// Settings recognized by the memory backend.
#[derive(Debug, Default, Deserialize)]
struct MemoryOptions {
    /// Accept byte-range reads (on by default).
    #[serde(default)]
    supports_bytes_range: Option<bool>,

    /// URL prefix for redirects; setting it enables redirects.
    #[serde(default)]
    redirect_base: Option<String>,
}

/// Storage driver that keeps content in memory.
///
/// Containers are implied by the paths stored beneath them: `images/abc` is a
/// container as long as some `images/abc/...` path holds content. The state is
/// owned by the instance and disappears with it.
///
/// Removing a path which holds nothing fails with `NotFound`.
#[derive(Debug)]
pub struct MemoryDriver {
    files: RwLock<BTreeMap<Utf8PathBuf, Bytes>>,
    capabilities: Capabilities,
    redirect_base: Option<String>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Create an empty `MemoryDriver` which supports byte ranges.
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            capabilities: Capabilities {
                supports_bytes_range: true,
                supports_redirect: false,
            },
            redirect_base: None,
        }
    }

    /// Build a driver from registry options.
    pub fn from_options(options: &DriverOptions) -> Result<Self, StorageError> {
        let options: MemoryOptions = options.parse(MEMORY_STORAGE_NAME)?;
        let mut driver = Self::new();
        if let Some(ranges) = options.supports_bytes_range {
            driver.capabilities.supports_bytes_range = ranges;
        }
        if let Some(base) = options.redirect_base {
            driver = driver.with_redirect_base(base);
        }
        Ok(driver)
    }

    /// Refuse byte-range reads, as a backend without seekable storage would.
    pub fn without_byte_ranges(mut self) -> Self {
        self.capabilities.supports_bytes_range = false;
        self
    }

    /// Offer redirects to `base` joined with the requested path.
    pub fn with_redirect_base(mut self, base: impl Into<String>) -> Self {
        self.redirect_base = Some(base.into());
        self.capabilities.supports_redirect = true;
        self
    }

    /// Iterate over the stored paths at or below `prefix`, in order.
    fn below<'m>(
        files: &'m BTreeMap<Utf8PathBuf, Bytes>,
        prefix: &'m Utf8Path,
    ) -> impl Iterator<Item = (&'m Utf8PathBuf, &'m Bytes)> + 'm {
        files
            .range::<Utf8Path, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(prefix))
    }
}

#[async_trait::async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        MEMORY_STORAGE_NAME
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let files = self.files.read().await;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))
    }

    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        tracing::trace!(%path, size = content.len(), "put memory content");
        let mut files = self.files.write().await;
        files.insert(path.to_owned(), content.clone());
        Ok(content)
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream<'static>, StorageError> {
        let range = ByteRange::require(range, self.capabilities, self.name())?;
        let content = self.get_content(path).await?;
        Ok(chunked(content, range))
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        mut content: ByteStream<'_>,
    ) -> Result<(), StorageError> {
        // Nothing is published until the stream completes, so an abandoned
        // write leaves the previous content in place.
        let mut buffer = BytesMut::new();
        while let Some(chunk) = content.try_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        self.put_content(path, buffer.freeze()).await?;
        Ok(())
    }

    async fn list_directory(
        &self,
        path: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let prefix = path.unwrap_or(Utf8Path::new(""));
        let files = self.files.read().await;

        let mut children: Vec<Utf8PathBuf> = Vec::new();
        for (stored, _) in Self::below(&files, prefix) {
            let Ok(rest) = stored.strip_prefix(prefix) else {
                continue;
            };
            if let Some(child) = rest.components().next() {
                let child = prefix.join(child.as_str());
                if children.last() != Some(&child) {
                    children.push(child);
                }
            }
        }

        if children.is_empty() && !prefix.as_str().is_empty() {
            return Err(StorageError::not_found(self.name(), prefix.as_str()));
        }

        tracing::trace!(%prefix, count = children.len(), "list memory directory");
        Ok(children)
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        let before = files.len();
        files.retain(|stored, _| !stored.starts_with(path));
        if files.len() == before {
            return Err(StorageError::not_found(self.name(), path.as_str()));
        }
        Ok(())
    }

    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|content| content.len() as u64)
            .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))
    }

    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        let files = self.files.read().await;
        let found = Self::below(&files, path).next().is_some();
        Ok(found)
    }

    fn content_redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
        crate::redirect(self.redirect_base.as_deref()?, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use registry_storage_driver::{StorageDriverExt, StorageErrorKind};

    #[tokio::test]
    async fn containers_are_implied_by_content() {
        let driver = MemoryDriver::new();
        driver
            .put_content(Utf8Path::new("images/abc/json"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        driver
            .put_content(Utf8Path::new("images/abc/layer"), Bytes::from_static(b"L"))
            .await
            .unwrap();
        driver
            .put_content(Utf8Path::new("images/def/json"), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert!(driver.exists(Utf8Path::new("images")).await.unwrap());
        assert!(driver.exists(Utf8Path::new("images/abc")).await.unwrap());
        assert!(!driver.exists(Utf8Path::new("images/ab")).await.unwrap());

        let images = driver
            .list_directory(Some(Utf8Path::new("images")))
            .await
            .unwrap();
        assert_eq!(images, vec!["images/abc", "images/def"]);

        let root = driver.list_directory(None).await.unwrap();
        assert_eq!(root, vec!["images"]);
    }

    #[tokio::test]
    async fn remove_is_recursive_and_reports_missing() {
        let driver = MemoryDriver::new();
        driver
            .put_string(Utf8Path::new("images/abc/json"), "{}")
            .await
            .unwrap();
        driver
            .put_string(Utf8Path::new("images/abcd/json"), "{}")
            .await
            .unwrap();

        driver.remove(Utf8Path::new("images/abc")).await.unwrap();
        assert!(!driver.exists(Utf8Path::new("images/abc/json")).await.unwrap());
        assert!(driver.exists(Utf8Path::new("images/abcd/json")).await.unwrap());

        let err = driver.remove(Utf8Path::new("images/abc")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn redirects_need_a_base() {
        let path = Utf8Path::new("images/abc/layer");
        let driver = MemoryDriver::new();
        assert!(driver.redirect_url(path).is_none());

        let driver = MemoryDriver::new().with_redirect_base("https://cdn.example.com/registry");
        assert!(driver.capabilities().supports_redirect);
        assert_eq!(
            driver.redirect_url(path).unwrap(),
            "https://cdn.example.com/registry/images/abc/layer"
        );
    }

    #[tokio::test]
    async fn options_configure_capabilities() {
        let mut options = DriverOptions::default();
        options
            .config
            .insert("supports_bytes_range".into(), false.into());
        let driver = MemoryDriver::from_options(&options).unwrap();
        assert!(!driver.capabilities().supports_bytes_range);

        options
            .config
            .insert("supports_bytes_range".into(), "yes".into());
        let err = MemoryDriver::from_options(&options).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
