//! OCI image layout access and layer extraction.
//!
//! Collectors pull catalog and release payload images to disk as OCI image
//! layouts. This module reads those layouts (index, manifests, configs) and
//! untars selected paths out of their layers:
//!
//! - the **FBC extractor** locates a catalog's declarative-config directory
//!   via the well-known label on the image config and extracts it
//! - the **release extractor** pulls `release-manifests/` out of a payload
//!   so `image-references` can be parsed
//!
//! Layer extraction validates entry paths the same way bundle builders do:
//! `..` components and absolute paths are rejected before anything touches
//! the filesystem.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tracing::{debug, warn};

use crate::api::RelatedImage;
use crate::constants::{CONFIGS_LABEL, MAX_CONFIG_SIZE, MAX_MANIFEST_SIZE};
use crate::error::{Error, Result};

// =============================================================================
// Layout Types
// =============================================================================

/// A content descriptor as it appears in indexes and manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// `index.json` of an OCI image layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// An OCI image manifest (config + layers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// The slice of an image config we care about: its labels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: ImageConfigInner,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigInner {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

// =============================================================================
// Release Payload Schema
// =============================================================================

/// The `release-manifests/image-references` document of a payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageReferences {
    #[serde(default)]
    pub kind: String,
    pub spec: ImageReferencesSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageReferencesSpec {
    #[serde(default)]
    pub tags: Vec<ImageTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageTag {
    pub name: String,
    pub from: ImageTagFrom,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageTagFrom {
    pub name: String,
}

// =============================================================================
// Layout Reading
// =============================================================================

/// Path of a blob inside an OCI layout.
fn layout_blob_path(layout: &Path, digest: &str) -> Result<PathBuf> {
    let hex = digest
        .strip_prefix("sha256:")
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| Error::Format {
            context: layout.display().to_string(),
            reason: format!("malformed digest '{}'", digest),
        })?;
    Ok(layout.join("blobs").join("sha256").join(hex))
}

/// Reads `index.json` from an OCI layout directory.
pub fn read_index(layout: &Path) -> Result<OciIndex> {
    let path = layout.join("index.json");
    let data =
        fs::read(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    serde_json::from_slice(&data).map_err(|e| Error::Format {
        context: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Reads an image manifest blob by digest.
pub fn read_manifest(layout: &Path, digest: &str) -> Result<OciManifest> {
    let path = layout_blob_path(layout, digest)?;
    let data =
        fs::read(&path).map_err(|_| Error::NotFound(format!("manifest blob {}", digest)))?;
    if data.len() > MAX_MANIFEST_SIZE {
        return Err(Error::Format {
            context: path.display().to_string(),
            reason: format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE),
        });
    }
    serde_json::from_slice(&data).map_err(|e| Error::Format {
        context: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Reads an image config blob by digest.
pub fn read_config(layout: &Path, digest: &str) -> Result<ImageConfig> {
    let path = layout_blob_path(layout, digest)?;
    let data =
        fs::read(&path).map_err(|_| Error::NotFound(format!("config blob {}", digest)))?;
    if data.len() > MAX_CONFIG_SIZE {
        return Err(Error::Format {
            context: path.display().to_string(),
            reason: format!("config exceeds {} bytes", MAX_CONFIG_SIZE),
        });
    }
    serde_json::from_slice(&data).map_err(|e| Error::Format {
        context: path.display().to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Layer Extraction
// =============================================================================

/// Untars every regular-file entry of the manifest's layers whose path
/// contains `filter`, writing it under `dest` with its entry path preserved.
///
/// Non-regular entries (directories, links, devices) are skipped with a
/// warning. Entry paths containing `..` or starting with `/` are rejected.
pub fn extract_layers(
    layout: &Path,
    manifest: &OciManifest,
    filter: &str,
    dest: &Path,
) -> Result<()> {
    for layer in &manifest.layers {
        let blob_path = layout_blob_path(layout, &layer.digest)?;
        let blob = fs::read(&blob_path)
            .map_err(|_| Error::NotFound(format!("layer blob {}", layer.digest)))?;

        let decoder = GzDecoder::new(&blob[..]);
        let mut archive = Archive::new(decoder);

        let entries = archive.entries().map_err(|e| Error::Format {
            context: layer.digest.clone(),
            reason: format!("gzip header failure: {}", e),
        })?;

        for entry in entries {
            let mut entry = entry.map_err(|e| Error::Format {
                context: layer.digest.clone(),
                reason: e.to_string(),
            })?;

            let entry_path = entry
                .path()
                .map_err(|e| Error::Format {
                    context: layer.digest.clone(),
                    reason: e.to_string(),
                })?
                .into_owned();
            let path_str = entry_path.to_string_lossy().to_string();

            if !path_str.contains(filter) {
                continue;
            }

            // SECURITY: reject traversal before any filesystem write
            if path_str.contains("..") || path_str.starts_with('/') {
                return Err(Error::Format {
                    context: layer.digest.clone(),
                    reason: format!("path traversal in entry '{}'", path_str),
                });
            }

            if !entry.header().entry_type().is_file() {
                if !entry.header().entry_type().is_dir() {
                    warn!("skipping non-regular entry {} in {}", path_str, layer.digest);
                }
                continue;
            }

            let target = dest.join(&entry_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }

            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(|e| Error::io(format!("reading entry {}", path_str), e))?;
            fs::write(&target, contents)
                .map_err(|e| Error::io(format!("writing {}", target.display()), e))?;

            debug!("extracted {}", target.display());
        }
    }
    Ok(())
}

// =============================================================================
// FBC Extraction
// =============================================================================

/// Extracts the declarative-config tree of a catalog image layout.
///
/// Reads the layout's single image manifest, resolves the configs directory
/// from the [`CONFIGS_LABEL`] label on the image config, untars matching
/// paths from every layer into `work_dir`, and returns the resulting
/// configs directory.
///
/// ## Errors
///
/// - [`Error::Format`]: unparseable index/manifest/config JSON, missing
///   label, or gzip failure
/// - [`Error::NotFound`]: a referenced blob is absent from the layout
/// - "no packages found in catalog" when the extracted tree is empty
pub fn extract_catalog_configs(layout: &Path, work_dir: &Path) -> Result<PathBuf> {
    let index = read_index(layout)?;
    let manifest_desc = index.manifests.first().ok_or_else(|| Error::Format {
        context: layout.display().to_string(),
        reason: "image index has no manifests".to_string(),
    })?;

    let manifest = read_manifest(layout, &manifest_desc.digest)?;
    let config = read_config(layout, &manifest.config.digest)?;

    let configs_dir = config
        .config
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CONFIGS_LABEL))
        .map(|s| s.trim_start_matches('/').to_string())
        .ok_or_else(|| Error::Format {
            context: layout.display().to_string(),
            reason: format!("missing label {}", CONFIGS_LABEL),
        })?;

    extract_layers(layout, &manifest, &configs_dir, work_dir)?;

    let extracted = work_dir.join(&configs_dir);
    let non_empty = extracted
        .read_dir()
        .map(|mut d| d.next().is_some())
        .unwrap_or(false);
    if !non_empty {
        return Err(Error::Format {
            context: layout.display().to_string(),
            reason: "no packages found in catalog".to_string(),
        });
    }
    Ok(extracted)
}

// =============================================================================
// Release Schema
// =============================================================================

/// Parses `release-manifests/image-references` and returns one
/// [`RelatedImage`] per `spec.tags[].from.name`.
pub fn read_release_schema(image_references: &Path) -> Result<Vec<RelatedImage>> {
    let data = fs::read(image_references).map_err(|_| {
        Error::NotFound(format!("image-references {}", image_references.display()))
    })?;
    let refs: ImageReferences = serde_json::from_slice(&data).map_err(|e| Error::Format {
        context: image_references.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(refs
        .spec
        .tags
        .into_iter()
        .map(|tag| RelatedImage {
            name: tag.name,
            image: tag.from.name,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_blob_path_rejects_bad_digest() {
        let layout = Path::new("/tmp/layout");
        assert!(layout_blob_path(layout, "sha256:short").is_err());
        assert!(layout_blob_path(layout, "md5:abcd").is_err());
        let good = format!("sha256:{}", "0a".repeat(32));
        let p = layout_blob_path(layout, &good).unwrap();
        assert!(p.ends_with(format!("blobs/sha256/{}", "0a".repeat(32))));
    }

    #[test]
    fn test_release_schema_parsing() {
        let doc = r#"{
            "kind": "ImageStream",
            "spec": {
                "tags": [
                    {"name": "machine-config-operator",
                     "from": {"name": "quay.io/openshift/release@sha256:aaaa"}},
                    {"name": "cli",
                     "from": {"name": "quay.io/openshift/release@sha256:bbbb"}}
                ]
            }
        }"#;
        let dir = std::env::temp_dir().join(format!("airlift-test-{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image-references");
        fs::write(&path, doc).unwrap();
        let images = read_release_schema(&path).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "machine-config-operator");
        assert!(images[1].image.ends_with("sha256:bbbb"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
