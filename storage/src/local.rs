use std::io::SeekFrom;

use bytes::Bytes;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use futures::{stream, StreamExt, TryStreamExt};
use http::Uri;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::Instrument;

use registry_storage_driver::{
    ByteRange, ByteStream, Capabilities, StorageDriver, StorageError, StorageErrorKind, CHUNK_SIZE,
};

use crate::registry::DriverOptions;

const LOCAL_STORAGE_NAME: &str = "local";

/// Directory under the root where writes are staged before they are renamed
/// into place. Hidden from root listings.
const STAGING: &str = ".staging";

/// Settings recognized by the local backend.
#[derive(Debug, Default, Deserialize)]
struct LocalOptions {
    /// URL prefix for redirects; setting it enables redirects.
    #[serde(default)]
    redirect_base: Option<String>,

    /// Internal URI prefix a reverse proxy serves the root under.
    #[serde(default)]
    sendfile_base: Option<String>,
}

/// Storage driver backed by a directory on the local filesystem.
///
/// Writes land in a staging file first and are renamed over the target, so a
/// reader never sees a partial file and an abandoned write leaves the previous
/// content untouched. Removing a missing path fails with `NotFound`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    redirect_base: Option<String>,
    sendfile_base: Option<String>,
}

impl LocalDriver {
    /// Create a driver storing everything below `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            redirect_base: None,
            sendfile_base: None,
        }
    }

    /// Build a driver from registry options. A root path is required.
    pub fn from_options(options: &DriverOptions) -> Result<Self, StorageError> {
        let root = options.root.clone().ok_or_else(|| {
            StorageError::new(
                LOCAL_STORAGE_NAME,
                StorageErrorKind::InvalidRequest,
                "local storage requires a root path",
            )
        })?;
        let settings: LocalOptions = options.parse(LOCAL_STORAGE_NAME)?;
        Ok(Self {
            root,
            redirect_base: settings.redirect_base,
            sendfile_base: settings.sendfile_base,
        })
    }

    /// The directory this driver stores content in.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        for component in remote.components() {
            match component {
                Utf8Component::Normal(_) | Utf8Component::CurDir => {}
                _ => {
                    return Err(StorageError::builder(
                        self.name(),
                        StorageErrorKind::InvalidRequest,
                        "path escapes the storage root",
                    )
                    .path(remote.as_str())
                    .build())
                }
            }
        }
        Ok(self.root.join(remote))
    }

    async fn metadata(
        &self,
        remote: &Utf8Path,
    ) -> Result<(Utf8PathBuf, std::fs::Metadata), StorageError> {
        let local = self.path(remote)?;
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|err| StorageError::io(self.name(), remote.as_str(), err))?;
        Ok((local, metadata))
    }

    async fn file(&self, remote: &Utf8Path) -> Result<(tokio::fs::File, u64), StorageError> {
        let (local, metadata) = self.metadata(remote).await?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(self.name(), remote.as_str()));
        }
        let file = tokio::fs::File::open(&local)
            .await
            .map_err(|err| StorageError::io(self.name(), remote.as_str(), err))?;
        Ok((file, metadata.len()))
    }
}

#[async_trait::async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &'static str {
        LOCAL_STORAGE_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_bytes_range: true,
            supports_redirect: self.redirect_base.is_some(),
        }
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let (mut file, size) = self.file(path).await?;
        let mut content = Vec::with_capacity(size as usize);
        file.read_to_end(&mut content)
            .await
            .map_err(|err| StorageError::io(self.name(), path.as_str(), err))?;
        Ok(content.into())
    }

    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        let chunks = stream::iter([Ok(content.clone())]).boxed();
        self.stream_write(path, chunks).await?;
        Ok(content)
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream<'static>, StorageError> {
        let range = ByteRange::require(range, self.capabilities(), self.name())?;
        let (mut file, size) = self.file(path).await?;

        let (start, stop) = range.map_or((0, size), |range| range.clamp(size));
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|err| StorageError::io(self.name(), path.as_str(), err))?;
        }

        tracing::trace!(%path, start, stop, "streaming local file");
        let name = self.name();
        let remote = path.to_string();
        Ok(
            ReaderStream::with_capacity(file.take(stop - start), CHUNK_SIZE)
                .map_err(move |err| StorageError::io(name, remote.clone(), err))
                .boxed(),
        )
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        mut content: ByteStream<'_>,
    ) -> Result<(), StorageError> {
        let target = self.path(path)?;
        let staging = self.root.join(STAGING);
        let io_error = |err: std::io::Error| StorageError::io(self.name(), path.as_str(), err);

        tokio::fs::create_dir_all(&staging).await.map_err(io_error)?;

        // Removed on drop, so failures and cancellation leave nothing behind.
        let (staged, file) = tokio::task::spawn_blocking(move || {
            let staged = tempfile::NamedTempFile::new_in(&staging)?;
            let file = staged.as_file().try_clone()?;
            Ok::<_, std::io::Error>((staged, file))
        })
        .in_current_span()
        .await
        .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Io, err))?
        .map_err(io_error)?;
        let mut writer = tokio::io::BufWriter::new(tokio::fs::File::from_std(file));

        let mut written = 0usize;
        while let Some(chunk) = content.try_next().await? {
            writer.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len();
        }
        writer.shutdown().await.map_err(io_error)?;
        drop(writer);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        tokio::task::spawn_blocking(move || staged.persist(target).map(drop))
            .in_current_span()
            .await
            .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Io, err))?
            .map_err(|err| io_error(err.error))?;

        tracing::trace!(%path, written, "wrote local file");
        Ok(())
    }

    async fn list_directory(
        &self,
        path: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let remote = path.unwrap_or(Utf8Path::new(""));
        let local = self.path(remote)?;

        let mut entries = match tokio::fs::read_dir(&local).await {
            Ok(entries) => entries,
            Err(err) if path.is_none() && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => {
                return Err(StorageError::not_found(self.name(), remote.as_str()))
            }
            Err(err) => return Err(StorageError::io(self.name(), remote.as_str(), err)),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::io(self.name(), remote.as_str(), err))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!(path = %remote, "skipping non utf-8 entry");
                continue;
            };
            if remote.as_str().is_empty() && name == STAGING {
                continue;
            }
            children.push(remote.join(name));
        }
        children.sort();

        tracing::debug!("Found {} entries", children.len());
        Ok(children)
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let (local, metadata) = self.metadata(path).await?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&local).await
        } else {
            tokio::fs::remove_file(&local).await
        };
        removed.map_err(|err| StorageError::io(self.name(), path.as_str(), err))
    }

    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        let (_, metadata) = self.metadata(path).await?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(self.name(), path.as_str()));
        }
        Ok(metadata.len())
    }

    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        let local = self.path(path)?;
        match tokio::fs::metadata(&local).await {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(StorageError::io(self.name(), path.as_str(), err)),
        }
    }

    fn content_redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
        crate::redirect(self.redirect_base.as_deref()?, path)
    }

    fn content_sendfile_uri(&self, path: &Utf8Path) -> Option<Uri> {
        crate::redirect(self.sendfile_base.as_deref()?, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use registry_storage_driver::StorageDriverExt;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn rejects_paths_outside_root() {
        let (_dir, driver) = driver();
        let err = driver
            .get_content(Utf8Path::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);

        let err = driver
            .exists(Utf8Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn staging_is_hidden_from_root_listing() {
        let (_dir, driver) = driver();
        driver
            .put_string(Utf8Path::new("images/abc/json"), "{}")
            .await
            .unwrap();

        let root = driver.list_directory(None).await.unwrap();
        assert_eq!(root, vec!["images"]);
        let staging = driver
            .list_directory(Some(Utf8Path::new(STAGING)))
            .await
            .unwrap();
        assert!(staging.is_empty(), "leftover staged files: {staging:?}");
    }

    #[tokio::test]
    async fn abandoned_write_keeps_previous_content() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("images/abc/layer");
        driver.put_string(path, "original").await.unwrap();

        let failing = stream::iter([
            Ok(Bytes::from_static(b"partial")),
            Err(StorageError::new(
                "test",
                StorageErrorKind::Io,
                "client went away",
            )),
        ])
        .boxed();
        assert!(driver.stream_write(path, failing).await.is_err());

        assert_eq!(driver.get_string(path).await.unwrap(), "original");
    }

    #[tokio::test]
    async fn directories_are_not_content() {
        let (_dir, driver) = driver();
        driver
            .put_string(Utf8Path::new("images/abc/json"), "{}")
            .await
            .unwrap();

        let err = driver
            .get_size(Utf8Path::new("images/abc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);

        let err = driver
            .list_directory(Some(Utf8Path::new("images/abc/json")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn file_parents_do_not_exist_as_containers() {
        let (_dir, driver) = driver();
        driver
            .put_string(Utf8Path::new("images/abc"), "not a directory")
            .await
            .unwrap();

        assert!(!driver
            .exists(Utf8Path::new("images/abc/_inprogress"))
            .await
            .unwrap());
        assert!(!driver.image_exists("abc").await.unwrap());
    }

    #[test]
    fn options_configure_sendfile() {
        let mut options = DriverOptions::with_root("/var/lib/registry");
        options
            .config
            .insert("sendfile_base".into(), "/_protected".into());
        let driver = LocalDriver::from_options(&options).unwrap();
        assert_eq!(
            driver
                .content_sendfile_uri(Utf8Path::new("images/abc/layer"))
                .unwrap(),
            "/_protected/images/abc/layer"
        );
        assert!(driver
            .content_redirect_url(Utf8Path::new("images/abc/layer"))
            .is_none());

        options.config.insert("redirect_base".into(), 7.into());
        let err = LocalDriver::from_options(&options).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[test]
    fn options_require_root() {
        let err = LocalDriver::from_options(&DriverOptions::default()).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
