//! Delete pipeline.
//!
//! Two sub-modes joined by a YAML contract:
//!
//! - **generate** runs the collectors, computes each image's transitive
//!   blob closure, and writes `delete/delete-images.yaml` plus a snapshot
//!   of the delete image-set config
//! - **execute** reads that file back (it is authoritative), optionally
//!   removes the related blob files from the local cache (only when
//!   forced), and always deletes the manifests from the destination
//!   registry through the batch copier in delete mode
//!
//! Destination-registry blobs are never deleted; garbage collection is the
//! registry operator's responsibility.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::api::{
    CollectorSchema, CopyFunction, CopyImage, DeleteImageList, DeleteItem, Mode,
};
use crate::batch::Batch;
use crate::blobgather::BlobGatherer;
use crate::cache::CacheStore;
use crate::config::DeleteImageSetConfig;
use crate::constants::{
    DELETE_IMAGESET_CONFIG_YAML, DELETE_IMAGES_YAML, DELETE_SUBDIR, DOCKER_PROTOCOL,
    MIRROR_API_VERSION,
};
use crate::copier::CopyOptions;
use crate::error::{Error, Result};

pub struct DeletePipeline {
    /// Working directory holding the `delete/` contract files.
    pub working_dir: PathBuf,
    /// Local cache, for forced blob deletion.
    pub cache: CacheStore,
    /// Explicit delete YAML path (execute mode); the generated location
    /// is used when absent.
    pub delete_yaml_file: Option<PathBuf>,
    /// Version discriminator for the generated file names.
    pub delete_id: Option<String>,
    /// Remove cache blob files during execute.
    pub force_cache_delete: bool,
}

impl DeletePipeline {
    /// Applies the delete-id substitution: every `.` in the base file name
    /// becomes `-<id>.`, landing the id in front of the extension segment.
    fn versioned(&self, base: &str) -> String {
        match &self.delete_id {
            Some(id) => base.replace('.', &format!("-{}.", id)),
            None => base.to_string(),
        }
    }

    fn images_yaml_path(&self) -> PathBuf {
        self.working_dir
            .join(DELETE_SUBDIR)
            .join(self.versioned(DELETE_IMAGES_YAML))
    }

    fn config_yaml_path(&self) -> PathBuf {
        self.working_dir
            .join(DELETE_SUBDIR)
            .join(self.versioned(DELETE_IMAGESET_CONFIG_YAML))
    }

    // =========================================================================
    // Generate
    // =========================================================================

    /// Writes the delete metadata for a collected image list, gathering
    /// each image's blob closure, plus the config snapshot.
    pub async fn write_delete_metadata(
        &self,
        images: &[CopyImage],
        gatherer: &BlobGatherer<'_>,
        config: &DeleteImageSetConfig,
    ) -> Result<PathBuf> {
        let delete_dir = self.working_dir.join(DELETE_SUBDIR);
        fs::create_dir_all(&delete_dir)
            .map_err(|e| Error::io(format!("creating {}", delete_dir.display()), e))?;
        info!("writing delete metadata to {}", delete_dir.display());

        // keyed by destination so repeated references collapse to one item
        let mut items_by_reference: std::collections::BTreeMap<String, DeleteItem> =
            std::collections::BTreeMap::new();
        for img in images {
            let related_blobs = match gatherer.gather(&img.source).await {
                Ok(blobs) => blobs,
                Err(e) => {
                    warn!("unable to gather blobs for {}: {}", img.source, e);
                    Vec::new()
                }
            };
            items_by_reference.insert(
                img.destination.clone(),
                DeleteItem {
                    image_name: img.origin.clone(),
                    image_reference: img.destination.clone(),
                    image_type: img.image_type,
                    related_blobs,
                },
            );
        }

        // BTreeMap iteration already yields items sorted by imageReference.
        let list = DeleteImageList {
            kind: "DeleteImageList".to_string(),
            api_version: MIRROR_API_VERSION.to_string(),
            items: items_by_reference.into_values().collect(),
        };
        let path = self.images_yaml_path();
        let payload = serde_yaml::to_string(&list).map_err(|e| Error::Format {
            context: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&path, payload)
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;

        // snapshot of the effective config, for reference alongside the list
        let disc_path = self.config_yaml_path();
        let disc = serde_yaml::to_string(config).map_err(|e| Error::Format {
            context: disc_path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&disc_path, disc)
            .map_err(|e| Error::io(format!("writing {}", disc_path.display()), e))?;

        Ok(path)
    }

    // =========================================================================
    // Execute
    // =========================================================================

    /// Reads the delete contract. The explicit `--delete-yaml-file` wins;
    /// otherwise the generated location is consulted.
    pub fn read_delete_metadata(&self) -> Result<DeleteImageList> {
        let path = match &self.delete_yaml_file {
            Some(path) => path.clone(),
            None => {
                let path = self.images_yaml_path();
                if !path.exists() {
                    return Err(Error::NotFound(format!(
                        "delete yaml file {} does not exist (please run delete --generate first)",
                        path.display()
                    )));
                }
                path
            }
        };
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_yaml::from_str(&data).map_err(|e| Error::Format {
            context: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Removes the related blob files from the local cache. Only invoked
    /// when the caller forces it; missing blobs are warned and skipped.
    pub fn delete_cache_blobs(&self, list: &DeleteImageList) -> Result<()> {
        info!("deleting images from local cache");
        for item in &list.items {
            for blob in &item.related_blobs {
                match self.cache.delete_blob(blob) {
                    Ok(true) => {}
                    Ok(false) => warn!("cache blob {} not found; ignoring", blob),
                    Err(e) => warn!("unable to delete cache blob {}: {}", blob, e),
                }
            }
        }
        Ok(())
    }

    /// Deletes the listed manifests from the destination registry via the
    /// batch copier in delete mode. Registry-relative references recorded
    /// by generate are joined onto `destination`.
    pub async fn delete_registry_images(
        &self,
        list: &DeleteImageList,
        destination: &str,
        batch: &Batch,
        opts: &CopyOptions,
    ) -> Result<CollectorSchema> {
        info!("deleting images from remote registry");
        let prefix = destination.trim_end_matches('/');
        let mut schema = CollectorSchema::default();
        schema.extend(
            list.items
                .iter()
                .map(|item| {
                    let destination = if item.image_reference.starts_with(DOCKER_PROTOCOL) {
                        item.image_reference.clone()
                    } else {
                        format!("{}/{}", prefix, item.image_reference)
                    };
                    CopyImage {
                        origin: item.image_name.clone(),
                        source: "delete-yaml".to_string(),
                        destination,
                        image_type: item.image_type,
                    }
                })
                .collect(),
        );
        batch
            .worker(&schema, CopyFunction::Delete, Mode::Delete, opts)
            .await
    }
}
