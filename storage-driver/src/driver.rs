use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, BoxStream, StreamExt};
use http::Uri;

use crate::error::StorageError;

/// Upper bound on the size of each chunk a streaming read yields.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A finite, non-restartable stream of content chunks.
///
/// Dropping the stream before it is exhausted releases whatever the backend
/// holds open for it.
pub type ByteStream<'s> = BoxStream<'s, Result<Bytes, StorageError>>;

/// Optional behaviour a backend may offer on top of the required primitives.
///
/// Callers check these before relying on the corresponding operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `stream_read` accepts a byte range.
    pub supports_bytes_range: bool,

    /// `content_redirect_url` can produce URLs for clients to fetch from directly.
    pub supports_redirect: bool,
}

/// A half-open `[start, stop)` byte interval of stored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// Offset of the first byte to read.
    pub start: u64,

    /// Offset one past the last byte to read.
    pub stop: u64,
}

impl ByteRange {
    /// Create a new range covering `[start, stop)`.
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    /// Clamp this range to content of `len` bytes, the way slice bounds
    /// would be clamped: `start` to `len`, then `stop` into `[start, len]`.
    pub fn clamp(self, len: u64) -> (u64, u64) {
        let start = self.start.min(len);
        let stop = self.stop.clamp(start, len);
        (start, stop)
    }

    /// Reject a requested range when the backend does not support ranges.
    pub fn require(
        range: Option<ByteRange>,
        capabilities: Capabilities,
        engine: &'static str,
    ) -> Result<Option<ByteRange>, StorageError> {
        match range {
            Some(_) if !capabilities.supports_bytes_range => {
                Err(StorageError::unsupported(engine, "byte range reads"))
            }
            range => Ok(range),
        }
    }
}

impl From<std::ops::Range<u64>> for ByteRange {
    fn from(range: std::ops::Range<u64>) -> Self {
        ByteRange::new(range.start, range.end)
    }
}

/// Stream in-memory content, optionally restricted to a range, in chunks of
/// at most [`CHUNK_SIZE`].
pub fn chunked(content: Bytes, range: Option<ByteRange>) -> ByteStream<'static> {
    let content = match range {
        Some(range) => {
            let (start, stop) = range.clamp(content.len() as u64);
            content.slice(start as usize..stop as usize)
        }
        None => content,
    };

    stream::unfold(content, |mut rest| async move {
        if rest.is_empty() {
            return None;
        }
        let chunk = rest.split_to(rest.len().min(CHUNK_SIZE));
        Some((Ok(chunk), rest))
    })
    .boxed()
}

/// A storage driver, which binds the registry to one physical storage medium.
///
/// Backends implement the primitives below. Every primitive has a default body
/// which fails with [`NotImplemented`](crate::StorageErrorKind::NotImplemented),
/// so a backend which only supports part of the contract still reports
/// clearly what it lacks. Higher level operations (text, JSON, image presence)
/// live in [`StorageDriverExt`](crate::StorageDriverExt) and are built only from
/// these primitives.
///
/// Paths are relative to the storage root and use `/` separators. Backends
/// must be safe to call concurrently; same-path writers race with
/// last-write-wins semantics.
#[async_trait::async_trait]
pub trait StorageDriver: fmt::Debug + Send + Sync {
    /// The name of the storage engine, used in errors and logs.
    fn name(&self) -> &'static str;

    /// The optional capabilities this backend offers.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Get the full content stored at `path`.
    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let _ = path;
        Err(StorageError::not_implemented(self.name(), "get_content"))
    }

    /// Atomically replace the content at `path`, creating parents as needed.
    /// Returns the stored content.
    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<Bytes, StorageError> {
        let _ = (path, content);
        Err(StorageError::not_implemented(self.name(), "put_content"))
    }

    /// Stream the content at `path`, or only `[start, stop)` of it when a
    /// range is given.
    ///
    /// Requesting a range from a backend without
    /// [`Capabilities::supports_bytes_range`] fails with
    /// [`UnsupportedOperation`](crate::StorageErrorKind::UnsupportedOperation).
    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream<'static>, StorageError> {
        let _ = (path, range);
        Err(StorageError::not_implemented(self.name(), "stream_read"))
    }

    /// Persist a stream of chunks to `path` without buffering all of it.
    async fn stream_write(
        &self,
        path: &Utf8Path,
        content: ByteStream<'_>,
    ) -> Result<(), StorageError> {
        let _ = (path, content);
        Err(StorageError::not_implemented(self.name(), "stream_write"))
    }

    /// List the immediate children of `path` (the storage root when `None`).
    ///
    /// Children are returned as full paths from the storage root.
    async fn list_directory(
        &self,
        path: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let _ = path;
        Err(StorageError::not_implemented(self.name(), "list_directory"))
    }

    /// Remove the content at `path`, or the container at `path` recursively.
    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let _ = path;
        Err(StorageError::not_implemented(self.name(), "remove"))
    }

    /// Size in bytes of the content at `path`.
    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        let _ = path;
        Err(StorageError::not_implemented(self.name(), "get_size"))
    }

    /// Whether `path` holds content or is a container.
    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        let _ = path;
        Err(StorageError::not_implemented(self.name(), "exists"))
    }

    /// A URL clients can be redirected to in order to fetch `path` directly.
    ///
    /// Only consulted when [`Capabilities::supports_redirect`] is set.
    fn content_redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
        let _ = path;
        None
    }

    /// An internal URI a reverse proxy in front of the registry can serve
    /// `path` from (`X-Sendfile` / `X-Accel-Redirect`).
    ///
    /// `None` when the backend's content is not reachable by such a proxy.
    fn content_sendfile_uri(&self, path: &Utf8Path) -> Option<Uri> {
        let _ = path;
        None
    }
}

macro_rules! forward_driver {
    ($($wrapper:ty),+) => {
        $(
        #[async_trait::async_trait]
        impl<D> StorageDriver for $wrapper
        where
            D: ?Sized + StorageDriver,
        {
            fn name(&self) -> &'static str {
                self.deref().name()
            }

            fn capabilities(&self) -> Capabilities {
                self.deref().capabilities()
            }

            async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
                self.deref().get_content(path).await
            }

            async fn put_content(
                &self,
                path: &Utf8Path,
                content: Bytes,
            ) -> Result<Bytes, StorageError> {
                self.deref().put_content(path, content).await
            }

            async fn stream_read(
                &self,
                path: &Utf8Path,
                range: Option<ByteRange>,
            ) -> Result<ByteStream<'static>, StorageError> {
                self.deref().stream_read(path, range).await
            }

            async fn stream_write(
                &self,
                path: &Utf8Path,
                content: ByteStream<'_>,
            ) -> Result<(), StorageError> {
                self.deref().stream_write(path, content).await
            }

            async fn list_directory(
                &self,
                path: Option<&Utf8Path>,
            ) -> Result<Vec<Utf8PathBuf>, StorageError> {
                self.deref().list_directory(path).await
            }

            async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
                self.deref().remove(path).await
            }

            async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
                self.deref().get_size(path).await
            }

            async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
                self.deref().exists(path).await
            }

            fn content_redirect_url(&self, path: &Utf8Path) -> Option<Uri> {
                self.deref().content_redirect_url(path)
            }

            fn content_sendfile_uri(&self, path: &Utf8Path) -> Option<Uri> {
                self.deref().content_sendfile_uri(path)
            }
        }
        )+
    };
}

forward_driver!(Arc<D>, Box<D>);

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::StorageErrorKind;

    static_assertions::assert_obj_safe!(StorageDriver);

    #[derive(Debug)]
    struct Skeleton;

    #[async_trait::async_trait]
    impl StorageDriver for Skeleton {
        fn name(&self) -> &'static str {
            "skeleton"
        }
    }

    #[tokio::test]
    async fn primitives_default_to_not_implemented() {
        let driver = Skeleton;
        let path = Utf8Path::new("images/abc123/layer");

        let err = driver.get_content(path).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotImplemented);
        assert_eq!(err.engine(), "skeleton");

        let err = driver.list_directory(None).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotImplemented);
        assert_eq!(err.context(), Some("list_directory"));

        assert_eq!(driver.capabilities(), Capabilities::default());
        assert!(driver.content_redirect_url(path).is_none());
        assert!(driver.content_sendfile_uri(path).is_none());
    }

    #[tokio::test]
    async fn wrappers_forward_to_the_inner_driver() {
        let driver: Arc<dyn StorageDriver> = Arc::new(Skeleton);
        assert_eq!(driver.name(), "skeleton");
        let err = driver.exists(Utf8Path::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotImplemented);

        let boxed: Box<dyn StorageDriver> = Box::new(Skeleton);
        assert_eq!(boxed.name(), "skeleton");
    }

    #[test]
    fn ranges_clamp_like_slices() {
        assert_eq!(ByteRange::new(2, 5).clamp(10), (2, 5));
        assert_eq!(ByteRange::new(2, 50).clamp(10), (2, 10));
        assert_eq!(ByteRange::new(20, 50).clamp(10), (10, 10));
        assert_eq!(ByteRange::new(5, 2).clamp(10), (5, 5));
    }

    #[test]
    fn ranges_require_capability() {
        let none = Capabilities::default();
        let err = ByteRange::require(Some(ByteRange::new(0, 1)), none, "skeleton").unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::UnsupportedOperation);
        assert!(ByteRange::require(None, none, "skeleton").unwrap().is_none());

        let ranged = Capabilities {
            supports_bytes_range: true,
            ..Capabilities::default()
        };
        assert_eq!(
            ByteRange::require(Some((1u64..3).into()), ranged, "skeleton").unwrap(),
            Some(ByteRange::new(1, 3))
        );
    }

    #[tokio::test]
    async fn chunked_splits_large_content() {
        let content = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let chunks: Vec<Bytes> = chunked(content.clone(), None).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_eq!(chunks.concat(), content.to_vec());

        let slice: Vec<Bytes> = chunked(Bytes::from_static(b"LAYERDATA"), Some((1u64..4).into()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(slice.concat(), b"AYE".to_vec());

        let empty: Vec<Bytes> = chunked(Bytes::new(), None).try_collect().await.unwrap();
        assert!(empty.is_empty());
    }
}
