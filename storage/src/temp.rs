use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use http::Uri;
use tempfile::TempDir;

use crate::local::LocalDriver;
use crate::registry::DriverOptions;
use registry_storage_driver::{
    ByteRange, ByteStream, Capabilities, StorageDriver, StorageError, StorageErrorKind,
};

const TEMP_STORAGE_NAME: &str = "tmp";

/// A storage driver that stores files in a temporary directory, deleted when
/// the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    // Dropped after `driver`, which still points into it.
    driver: LocalDriver,
    #[allow(unused)]
    dir: TempDir,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let (dir, root) = Self::tempdir()?;
        Ok(Self {
            driver: LocalDriver::new(root),
            dir,
        })
    }

    fn tempdir() -> io::Result<(TempDir, Utf8PathBuf)> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;
        Ok((tmp, root))
    }

    /// Build a driver from registry options. The root path is ignored; every
    /// other setting is read as for [`LocalDriver`].
    pub fn from_options(options: &DriverOptions) -> Result<Self, StorageError> {
        if let Some(root) = &options.root {
            tracing::debug!(%root, "temporary storage ignores the configured root");
        }
        let (dir, root) =
            Self::tempdir().map_err(StorageError::with(TEMP_STORAGE_NAME, StorageErrorKind::Io))?;
        let driver = LocalDriver::from_options(&DriverOptions {
            root: Some(root),
            config: options.config.clone(),
        })?;
        Ok(Self { driver, dir })
    }

    /// The temporary directory backing this driver.
    pub fn root(&self) -> &Utf8Path {
        self.driver.root()
    }
}

#[async_trait::async_trait]
impl StorageDriver for TempDriver {
    fn name(&self) -> &'static str {
        TEMP_STORAGE_NAME
    }

    fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        self.driver.put_content(path, content).await
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream<'static>, StorageError> {
        self.driver.stream_read(path, range).await
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        content: ByteStream<'_>,
    ) -> Result<(), StorageError> {
        self.driver.stream_write(path, content).await
    }

    async fn list_directory(
        &self,
        path: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list_directory(path).await
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.remove(path).await
    }

    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        self.driver.get_size(path).await
    }

    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(path).await
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
    fn engine_name_is_the_registered_scheme() {
        let storage = crate::fetch(TEMP_STORAGE_NAME)
            .unwrap()
            .open(DriverOptions::default())
            .unwrap();
        assert_eq!(storage.name(), storage.scheme());
    }

    #[tokio::test]
    async fn directory_is_removed_on_drop() {
        let driver = TempDriver::new().unwrap();
        let root = driver.root().to_owned();
        driver
            .put_content(Utf8Path::new("images/abc/layer"), Bytes::from_static(b"L"))
            .await
            .unwrap();
        assert!(root.join("images/abc/layer").exists());

        drop(driver);
        assert!(!root.exists());
    }
}
