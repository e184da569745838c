//! Lazy scans over the entity hierarchy, for maintenance and migration jobs.
//!
//! A container which does not exist yet is simply empty here: listing
//! failures of kind [`NotFound`](crate::StorageErrorKind::NotFound) are
//! turned into empty results, and every other error is yielded to the caller.
//! Calling a function again restarts the scan from the top.

use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::convenience::StorageDriverExt;
use crate::driver::StorageDriver;
use crate::encode::decode;
use crate::error::StorageError;
use crate::paths::{self, IMAGES, REPOSITORIES, TAG_PREFIX};

async fn list_or_empty<D>(driver: &D, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError>
where
    D: StorageDriver + ?Sized,
{
    match driver.list_directory(Some(path)).await {
        Err(err) if err.is_not_found() => {
            tracing::trace!(%path, "container missing, nothing to enumerate");
            Ok(Vec::new())
        }
        other => other,
    }
}

fn segment(path: &Utf8Path) -> String {
    decode(path.file_name().unwrap_or_default())
}

/// Every image id in storage.
pub fn iterate_images<D>(driver: &D) -> BoxStream<'_, Result<String, StorageError>>
where
    D: StorageDriver + ?Sized,
{
    stream::once(list_or_empty(driver, Utf8Path::new(IMAGES)))
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, StorageError>)))
        .try_flatten()
        .map_ok(|path| segment(&path))
        .boxed()
}

/// Every `(namespace, repository)` pair in storage.
///
/// Namespaces are listed one at a time as the stream is pulled. A namespace
/// which vanishes between the two listings contributes nothing.
pub fn iterate_repositories<D>(driver: &D) -> BoxStream<'_, Result<(String, String), StorageError>>
where
    D: StorageDriver + ?Sized,
{
    stream::once(list_or_empty(driver, Utf8Path::new(REPOSITORIES)))
        .map_ok(|namespaces| stream::iter(namespaces.into_iter().map(Ok::<_, StorageError>)))
        .try_flatten()
        .and_then(move |namespace_path| async move {
            let repositories = list_or_empty(driver, &namespace_path).await?;
            let namespace = segment(&namespace_path);
            tracing::trace!(%namespace, count = repositories.len(), "listed namespace");
            Ok::<_, StorageError>(stream::iter(repositories.into_iter().map(
                move |repository| Ok::<_, StorageError>((namespace.clone(), segment(&repository))),
            )))
        })
        .try_flatten()
        .boxed()
}

/// Every `(tag, image_id)` pair of one repository.
///
/// Tag pointers are the entries whose final segment starts with `tag_`; each
/// pointer's content is fetched as the stream reaches it.
pub fn iterate_tags<'d, D>(
    driver: &'d D,
    namespace: &str,
    repository: &str,
) -> BoxStream<'d, Result<(String, String), StorageError>>
where
    D: StorageDriver + ?Sized,
{
    let root = paths::tag_path(namespace, repository, None);
    stream::once(async move { list_or_empty(driver, &root).await })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, StorageError>)))
        .try_flatten()
        .try_filter_map(move |path| async move {
            let Some(tag) = path
                .file_name()
                .and_then(|name| name.strip_prefix(TAG_PREFIX))
            else {
                return Ok::<_, StorageError>(None);
            };
            let tag = decode(tag);
            let image = driver.get_string(&path).await?;
            Ok(Some((tag, image)))
        })
        .boxed()
}
