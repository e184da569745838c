//! Operations derived from the [`StorageDriver`] primitives.
//!
//! [`StorageDriverExt`] is implemented for every driver through a blanket
//! impl, so backends only ever supply primitives and all of them agree on how
//! text, JSON and image state are represented.

use bytes::Bytes;
use camino::Utf8Path;
use http::Uri;
use serde::{de::DeserializeOwned, Serialize};

use crate::driver::StorageDriver;
use crate::error::{StorageError, StorageErrorKind};
use crate::paths;

/// Convenience encodings and registry-level checks built on the primitives.
#[async_trait::async_trait]
pub trait StorageDriverExt: StorageDriver {
    /// Raw bytes at `path`.
    async fn get_bytes(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.get_content(path).await
    }

    /// Store raw bytes at `path`.
    async fn put_bytes(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        self.put_content(path, content).await
    }

    /// Content at `path` decoded as UTF-8.
    async fn get_string(&self, path: &Utf8Path) -> Result<String, StorageError> {
        let content = self.get_bytes(path).await?;
        String::from_utf8(content.into()).map_err(|err| {
            StorageError::builder(self.name(), StorageErrorKind::Serialization, err)
                .path(path.as_str())
                .context("decode utf-8")
                .build()
        })
    }

    /// Store `content` at `path` as UTF-8.
    async fn put_string(&self, path: &Utf8Path, content: &str) -> Result<Bytes, StorageError> {
        self.put_bytes(path, Bytes::copy_from_slice(content.as_bytes()))
            .await
    }

    /// Content at `path` parsed as JSON.
    async fn get_json<T>(&self, path: &Utf8Path) -> Result<T, StorageError>
    where
        T: DeserializeOwned + Send,
    {
        let content = self.get_string(path).await?;
        serde_json::from_str(&content).map_err(|err| {
            StorageError::builder(self.name(), StorageErrorKind::Serialization, err)
                .path(path.as_str())
                .context("parse json")
                .build()
        })
    }

    /// Store `value` at `path` serialized as JSON.
    async fn put_json<T>(&self, path: &Utf8Path, value: &T) -> Result<Bytes, StorageError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let content = serde_json::to_string(value).map_err(|err| {
            StorageError::builder(self.name(), StorageErrorKind::Serialization, err)
                .path(path.as_str())
                .context("serialize json")
                .build()
        })?;
        self.put_string(path, &content).await
    }

    /// Whether an image upload has completed: the in-progress marker is
    /// absent and the layer is present.
    async fn image_exists(&self, image: &str) -> Result<bool, StorageError> {
        if self.exists(&paths::image_mark_path(image)).await? {
            return Ok(false);
        }
        self.exists(&paths::image_layer_path(image)).await
    }

    /// Write the in-progress marker for `image`, starting an upload.
    async fn mark_image_in_progress(&self, image: &str) -> Result<(), StorageError> {
        self.put_content(&paths::image_mark_path(image), Bytes::from_static(b"true"))
            .await?;
        Ok(())
    }

    /// Clear the in-progress marker for `image` once every dependent write
    /// has succeeded. Clearing an absent marker is not an error.
    async fn clear_image_mark(&self, image: &str) -> Result<(), StorageError> {
        match self.remove(&paths::image_mark_path(image)).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Size in bytes of the layer of `image`.
    async fn image_size(&self, image: &str) -> Result<u64, StorageError> {
        self.get_size(&paths::image_layer_path(image)).await
    }

    /// The metadata of `image`, as `docker inspect` reports it.
    async fn get_image_metadata<T>(&self, image: &str) -> Result<T, StorageError>
    where
        T: DeserializeOwned + Send,
    {
        self.get_json(&paths::image_json_path(image)).await
    }

    /// The ancestry of `image`, nearest ancestor first.
    async fn get_ancestry(&self, image: &str) -> Result<Vec<String>, StorageError> {
        self.get_json(&paths::image_ancestry_path(image)).await
    }

    /// The image id a tag points at.
    async fn get_tag(
        &self,
        namespace: &str,
        repository: &str,
        tag: &str,
    ) -> Result<String, StorageError> {
        self.get_string(&paths::tag_path(namespace, repository, Some(tag)))
            .await
    }

    /// Point a tag at `image`, replacing any previous value.
    async fn put_tag(
        &self,
        namespace: &str,
        repository: &str,
        tag: &str,
        image: &str,
    ) -> Result<(), StorageError> {
        self.put_string(&paths::tag_path(namespace, repository, Some(tag)), image)
            .await?;
        Ok(())
    }

    /// Whether accessing the repository requires authorization.
    async fn is_private(&self, namespace: &str, repository: &str) -> Result<bool, StorageError> {
        self.exists(&paths::private_flag_path(namespace, repository))
            .await
    }

    /// A redirect URL for `path`, if the backend supports redirects at all.
    fn redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
        if !self.capabilities().supports_redirect {
            return None;
        }
        self.content_redirect_url(path)
    }

    /// A redirect URL for the layer of `image`.
    fn image_redirect_url(&self, image: &str) -> Option<Uri> {
        self.redirect_url(&paths::image_layer_path(image))
    }

    /// An internal URI a reverse proxy can serve the layer of `image` from.
    fn image_sendfile_uri(&self, image: &str) -> Option<Uri> {
        self.content_sendfile_uri(&paths::image_layer_path(image))
    }
}

impl<D> StorageDriverExt for D where D: StorageDriver + ?Sized {}
