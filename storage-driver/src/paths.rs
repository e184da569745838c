//! Canonical storage paths for registry entities.
//!
//! These shapes are what existing deployments have on disk and in object
//! stores, so segment names and ordering must not change. Every function
//! encodes its arguments with [`encode`] before joining; the literal segments
//! (`json`, `layer`, `tag_`, ...) are never encoded.

use std::fmt;

use camino::Utf8PathBuf;

use crate::encode::encode;

/// Root of all repository data.
pub const REPOSITORIES: &str = "repositories";

/// Root of all image data.
pub const IMAGES: &str = "images";

/// Marker which prefixes the final segment of every tag pointer.
pub const TAG_PREFIX: &str = "tag_";

fn repository_root(namespace: &str, repository: &str) -> String {
    format!("{REPOSITORIES}/{namespace}/{repository}")
}

fn image_root(image: &str) -> String {
    format!("{IMAGES}/{image}")
}

/// `repositories/<namespace>/<repository>`
pub fn repository_path(namespace: impl fmt::Display, repository: impl fmt::Display) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    repository_root(&namespace, &repository).into()
}

/// `repositories/<namespace>/<repository>/tag_<tagname>`, or the repository
/// path itself when no tag name (or an empty one) is given.
pub fn tag_path(
    namespace: impl fmt::Display,
    repository: impl fmt::Display,
    tagname: Option<&str>,
) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    let root = repository_root(&namespace, &repository);
    match tagname {
        Some(tag) if !tag.is_empty() => format!("{root}/{TAG_PREFIX}{}", encode(tag)).into(),
        _ => root.into(),
    }
}

/// `repositories/<namespace>/<repository>/json`
pub fn repository_json_path(
    namespace: impl fmt::Display,
    repository: impl fmt::Display,
) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    format!("{}/json", repository_root(&namespace, &repository)).into()
}

/// `repositories/<namespace>/<repository>/tag<tag>_json`
pub fn repository_tag_json_path(
    namespace: impl fmt::Display,
    repository: impl fmt::Display,
    tag: impl fmt::Display,
) -> Utf8PathBuf {
    let (namespace, repository, tag) = (encode(&namespace), encode(&repository), encode(&tag));
    format!("{}/tag{tag}_json", repository_root(&namespace, &repository)).into()
}

/// `repositories/<namespace>/<repository>/_images_list`
pub fn images_list_path(namespace: impl fmt::Display, repository: impl fmt::Display) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    format!("{}/_images_list", repository_root(&namespace, &repository)).into()
}

/// `repositories/<namespace>/<repository>/_index_images`
pub fn index_images_path(
    namespace: impl fmt::Display,
    repository: impl fmt::Display,
) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    format!("{}/_index_images", repository_root(&namespace, &repository)).into()
}

/// `repositories/<namespace>/<repository>/_private`
pub fn private_flag_path(
    namespace: impl fmt::Display,
    repository: impl fmt::Display,
) -> Utf8PathBuf {
    let (namespace, repository) = (encode(&namespace), encode(&repository));
    format!("{}/_private", repository_root(&namespace, &repository)).into()
}

/// `images/<image_id>`
pub fn image_path(image: impl fmt::Display) -> Utf8PathBuf {
    image_root(&encode(&image)).into()
}

/// `images/<image_id>/json`
pub fn image_json_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/json", image_root(&encode(&image))).into()
}

/// `images/<image_id>/_inprogress`
pub fn image_mark_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/_inprogress", image_root(&encode(&image))).into()
}

/// `images/<image_id>/_checksum`
pub fn image_checksum_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/_checksum", image_root(&encode(&image))).into()
}

/// `images/<image_id>/layer`
pub fn image_layer_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/layer", image_root(&encode(&image))).into()
}

/// `images/<image_id>/ancestry`
pub fn image_ancestry_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/ancestry", image_root(&encode(&image))).into()
}

/// `images/<image_id>/_files`
pub fn image_files_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/_files", image_root(&encode(&image))).into()
}

/// `images/<image_id>/_diff`
pub fn image_diff_path(image: impl fmt::Display) -> Utf8PathBuf {
    format!("{}/_diff", image_root(&encode(&image))).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn repository_shapes() {
        assert_eq!(repository_path("lib", "app"), "repositories/lib/app");
        assert_eq!(
            tag_path("lib", "app", Some("v1")),
            "repositories/lib/app/tag_v1"
        );
        assert_eq!(tag_path("lib", "app", None), "repositories/lib/app");
        assert_eq!(tag_path("lib", "app", Some("")), "repositories/lib/app");
        assert_eq!(
            repository_json_path("lib", "app"),
            "repositories/lib/app/json"
        );
        assert_eq!(
            repository_tag_json_path("lib", "app", "v1"),
            "repositories/lib/app/tagv1_json"
        );
        assert_eq!(
            images_list_path("lib", "app"),
            "repositories/lib/app/_images_list"
        );
        assert_eq!(
            index_images_path("lib", "app"),
            "repositories/lib/app/_index_images"
        );
        assert_eq!(
            private_flag_path("lib", "app"),
            "repositories/lib/app/_private"
        );
    }

    #[test]
    fn image_shapes() {
        assert_eq!(image_path("abc123"), "images/abc123");
        assert_eq!(image_json_path("abc123"), "images/abc123/json");
        assert_eq!(image_mark_path("abc123"), "images/abc123/_inprogress");
        assert_eq!(image_checksum_path("abc123"), "images/abc123/_checksum");
        assert_eq!(image_layer_path("abc123"), "images/abc123/layer");
        assert_eq!(image_ancestry_path("abc123"), "images/abc123/ancestry");
        assert_eq!(image_files_path("abc123"), "images/abc123/_files");
        assert_eq!(image_diff_path("abc123"), "images/abc123/_diff");
    }

    #[test]
    fn empty_identifiers_keep_their_level() {
        assert_eq!(image_layer_path(""), "images/%20/layer");
        assert_ne!(image_layer_path(""), image_path("layer"));
        assert_ne!(repository_json_path("", "json"), repository_path("json", ""));
        assert_eq!(repository_path("", ""), "repositories/%20/%20");
    }

    #[test]
    fn traversal_stays_inside_the_hierarchy() {
        assert_eq!(image_layer_path(".."), "images/%2E%2E/layer");
        assert_eq!(
            repository_json_path(".", "../../etc"),
            "repositories/%2E/..%2F..%2Fetc/json"
        );
        assert_eq!(
            tag_path("lib", "app", Some("../x")),
            "repositories/lib/app/tag_..%2Fx"
        );
    }

    proptest! {
        #[test]
        fn untagged_path_is_strict_prefix(ns in "[a-z0-9_.-]{1,12}", repo in ".{1,12}") {
            let root = tag_path(&ns, &repo, None);
            let latest = tag_path(&ns, &repo, Some("latest"));
            prop_assert!(latest.starts_with(&root));
            prop_assert_ne!(latest, root);
        }

        #[test]
        fn image_paths_are_injective(a in ".{0,12}", b in ".{0,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(image_layer_path(&a), image_layer_path(&b));
        }

        #[test]
        fn repository_paths_have_two_segments(ns in ".{0,12}", repo in ".{0,12}") {
            let path = repository_path(&ns, &repo);
            prop_assert_eq!(path.as_str().split('/').count(), 3);
            prop_assert!(path.as_str().split('/').all(|segment| !segment.is_empty()));
        }
    }
}
