//! Image collectors.
//!
//! Each collector turns one category of the image-set config into a flat
//! list of [`CopyImage`] work items with mode-appropriate source and
//! destination references:
//!
//! - [`release::ReleaseCollector`] — platform release payloads and their
//!   referenced images, via the update graph
//! - [`operator::OperatorCollector`] — operator catalogs and the bundle
//!   images selected by the package filters
//! - [`additional::AdditionalCollector`] — user-named images
//!
//! Collection strictly precedes copying; collectors fail fast.

pub mod additional;
pub mod operator;
pub mod release;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::api::{CopyImage, Mode};
use crate::constants::DOCKER_PROTOCOL;
use crate::error::Result;
use crate::image::ImageRef;

/// Shared state every collector needs.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Run mode; decides how source/destination pairs are built.
    pub mode: Mode,
    /// The working directory of this run.
    pub working_dir: PathBuf,
    /// `localhost:<port>` of the embedded cache registry.
    pub cache_fqdn: String,
    /// Destination registry prefix (`docker://host[/namespace]`) for
    /// DiskToMirror and MirrorToMirror; empty otherwise.
    pub destination: String,
}

/// A collector produces the copy list for one config category.
#[async_trait]
pub trait Collector {
    async fn collect(&self) -> Result<Vec<CopyImage>>;
}

impl CollectorContext {
    /// Cache-registry destination for a reference, preserving the digest
    /// form (`@sha256:...`) or tag.
    pub fn cache_destination(&self, image: &ImageRef) -> String {
        match &image.digest {
            Some(digest) => format!(
                "{}{}/{}@{}",
                DOCKER_PROTOCOL,
                self.cache_fqdn,
                image.path_component(),
                digest
            ),
            None => format!(
                "{}{}/{}:{}",
                DOCKER_PROTOCOL,
                self.cache_fqdn,
                image.path_component(),
                image.tag.as_deref().unwrap_or("latest")
            ),
        }
    }

    /// Cache-registry destination using a truncated-digest tag, the form
    /// catalogs are stored under.
    pub fn cache_destination_truncated(&self, image: &ImageRef) -> String {
        match image.digest_truncated() {
            Some(tag) => format!(
                "{}{}/{}:{}",
                DOCKER_PROTOCOL,
                self.cache_fqdn,
                image.path_component(),
                tag
            ),
            None => self.cache_destination(image),
        }
    }

    /// Final-registry destination for a reference.
    pub fn remote_destination(&self, image: &ImageRef) -> String {
        let prefix = self.destination.trim_end_matches('/');
        match &image.digest {
            Some(digest) => format!("{}/{}@{}", prefix, image.path_component(), digest),
            None => format!(
                "{}/{}:{}",
                prefix,
                image.path_component(),
                image.tag.as_deref().unwrap_or("latest")
            ),
        }
    }

    /// Cache-registry source for a reference (DiskToMirror reads from the
    /// cache).
    pub fn cache_source(&self, image: &ImageRef) -> String {
        self.cache_destination(image)
    }

    /// Registry-relative reference recorded in delete metadata. The
    /// execute phase joins it onto its `--destination` prefix, so the
    /// generate phase needs no destination of its own.
    pub fn delete_reference(&self, image: &ImageRef) -> String {
        match &image.digest {
            Some(digest) => format!("{}@{}", image.path_component(), digest),
            None => format!(
                "{}:{}",
                image.path_component(),
                image.tag.as_deref().unwrap_or("latest")
            ),
        }
    }
}

/// Rewrites copy destinations so no repository path exceeds
/// `max_nested_paths` components; deeper components are joined with `-`.
/// Registries with fixed nesting limits (e.g. two-level project/repo
/// layouts) need this on DiskToMirror.
pub fn rewrite_max_nested_paths(images: &mut [CopyImage], max_nested_paths: usize) -> Result<()> {
    if max_nested_paths == 0 {
        return Ok(());
    }
    for img in images.iter_mut() {
        let Some(rest) = img.destination.strip_prefix(DOCKER_PROTOCOL) else {
            continue;
        };
        let (path, suffix) = match rest.find(['@', ':']) {
            // a ':' belonging to a registry port sits before the first '/'
            Some(_) => {
                let split_at = rest
                    .rfind('@')
                    .or_else(|| rest.rfind('/').and_then(|s| rest[s..].find(':').map(|c| s + c)))
                    .unwrap_or(rest.len());
                (&rest[..split_at], &rest[split_at..])
            }
            None => (rest, ""),
        };
        let mut components: Vec<&str> = path.split('/').collect();
        // first component is the registry host and does not count
        if components.len() > max_nested_paths + 1 {
            let tail = components.split_off(max_nested_paths).join("-");
            let head = components.join("/");
            img.destination = format!("{}{}/{}{}", DOCKER_PROTOCOL, head, tail, suffix);
        }
    }
    Ok(())
}
