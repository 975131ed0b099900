//! Image-set configuration.
//!
//! The user-facing YAML document declaring what to mirror: platform release
//! channels, operator catalogs with package filters, and additional images.
//! A structurally identical `DeleteImageSetConfiguration` drives the delete
//! workflow.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ARCHIVE_SIZE;
use crate::error::{Error, Result};

/// Top-level image-set configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetConfig {
    pub kind: String,
    pub api_version: String,
    /// Maximum archive chunk size in GiB. Zero or absent selects the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Delete configuration document; same payload under a `delete` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteImageSetConfig {
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub delete: MirrorConfig,
}

/// The three mirrored categories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<OperatorConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_images: Vec<AdditionalImage>,
}

/// Platform release selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(default)]
    pub channels: Vec<ReleaseChannel>,
    /// Request the synthetic update-graph data image.
    #[serde(default)]
    pub graph: bool,
}

/// One release channel with an optional version window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseChannel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// One operator catalog and its package filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub catalog: String,
    /// Select every bundle of the filtered channels instead of heads/ranges.
    #[serde(default)]
    pub full: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageFilter>,
}

/// Filter for a single package within a catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFilter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// Filter for a channel within a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFilter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// A user-named additional image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalImage {
    pub name: String,
}

impl ImageSetConfig {
    /// Loads and validates the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| Error::Format {
            context: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if config.kind != "ImageSetConfiguration" {
            return Err(Error::Validation(format!(
                "unexpected kind '{}' in {} (expected ImageSetConfiguration)",
                config.kind,
                path.display()
            )));
        }
        Ok(config)
    }

    /// Effective archive chunk size in bytes.
    pub fn archive_size_bytes(&self) -> u64 {
        match self.archive_size {
            Some(gib) if gib > 0 => gib * 1024 * 1024 * 1024,
            _ => DEFAULT_ARCHIVE_SIZE,
        }
    }
}

impl DeleteImageSetConfig {
    /// Loads and validates a delete configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| Error::Format {
            context: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if config.kind != "DeleteImageSetConfiguration" {
            return Err(Error::Validation(format!(
                "unexpected kind '{}' in {} (expected DeleteImageSetConfiguration)",
                config.kind,
                path.display()
            )));
        }
        Ok(config)
    }

    /// Borrow the payload as a mirror config so collectors can run unchanged.
    pub fn as_mirror(&self) -> &MirrorConfig {
        &self.delete
    }
}
