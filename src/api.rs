//! Shared schema types passed between collectors, the batch copier, and
//! the delete pipeline.

use serde::{Deserialize, Serialize};

/// Top-level run mode, validated from the (source, destination) tuple
/// before any state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Registry sources into the local cache plus an archive.
    MirrorToDisk,
    /// An extracted archive into a destination registry.
    DiskToMirror,
    /// Registry sources straight into a destination registry.
    MirrorToMirror,
    /// Prune previously mirrored content.
    Delete,
    /// Dry verification of cache completeness.
    Prepare,
}

impl Mode {
    /// Modes whose batch output lands in the local cache.
    pub fn is_disk_producing(&self) -> bool {
        matches!(self, Self::MirrorToDisk | Self::MirrorToMirror)
    }
}

/// What the copy primitive should do with a (source, destination) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFunction {
    Copy,
    Delete,
}

/// Category of a mirrored image; drives batch accounting and the
/// fail-fast/fail-safe split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageType {
    /// Synthetic update-graph data image.
    CincinnatiGraph,
    /// Platform release payload.
    OcpRelease,
    /// An image referenced by a release payload.
    OcpReleaseContent,
    /// Operator catalog (index) image.
    OperatorCatalog,
    /// Operator bundle image.
    OperatorBundle,
    /// An image a bundle depends on.
    OperatorRelatedImage,
    /// User-named additional image.
    Generic,
}

impl ImageType {
    /// Release-typed images fail the whole batch when their copy fails.
    pub fn is_release(&self) -> bool {
        matches!(self, Self::OcpRelease | Self::OcpReleaseContent)
    }

    /// Category bucket for progress accounting.
    pub fn category(&self) -> ImageCategory {
        match self {
            Self::CincinnatiGraph | Self::OcpRelease | Self::OcpReleaseContent => {
                ImageCategory::Release
            }
            Self::OperatorCatalog | Self::OperatorBundle | Self::OperatorRelatedImage => {
                ImageCategory::Operator
            }
            Self::Generic => ImageCategory::Additional,
        }
    }
}

/// Progress-accounting bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Release,
    Operator,
    Additional,
}

/// A single image copy work item.
///
/// `origin` is the user-facing logical name; `source` and `destination`
/// are fully qualified references with transport prefixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyImage {
    pub origin: String,
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
}

/// An image named by a catalog bundle or release payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedImage {
    #[serde(default)]
    pub name: String,
    pub image: String,
}

/// Flat image list plus per-category totals, as produced by the collectors.
#[derive(Debug, Clone, Default)]
pub struct CollectorSchema {
    pub all_images: Vec<CopyImage>,
    pub total_release_images: usize,
    pub total_operator_images: usize,
    pub total_additional_images: usize,
}

impl CollectorSchema {
    /// Appends images, updating the per-category totals.
    pub fn extend(&mut self, images: Vec<CopyImage>) {
        for img in &images {
            match img.image_type.category() {
                ImageCategory::Release => self.total_release_images += 1,
                ImageCategory::Operator => self.total_operator_images += 1,
                ImageCategory::Additional => self.total_additional_images += 1,
            }
        }
        self.all_images.extend(images);
    }

    pub fn len(&self) -> usize {
        self.all_images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_images.is_empty()
    }
}

/// One entry of the delete contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItem {
    pub image_name: String,
    pub image_reference: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    /// Transitive digest closure of the image, sorted ascending.
    #[serde(default)]
    pub related_blobs: Vec<String>,
}

/// The delete metadata document written by delete-generate and consumed
/// by delete-execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteImageList {
    pub kind: String,
    pub api_version: String,
    pub items: Vec<DeleteItem>,
}
