//! Image copy primitive.
//!
//! One entry point, [`Copier::run`], moves a single image between any two
//! of the supported transports:
//!
//! | Source | Destination | Used by |
//! |--------|-------------|---------|
//! | `docker://` | `docker://` | cache fill, disk-to-mirror push |
//! | `docker://` | `oci://`    | catalog / release payload pulls |
//! | `oci://`    | `docker://` | pushing an on-disk layout |
//!
//! In delete mode the destination manifest is removed instead.
//!
//! ## Concurrency
//!
//! Layer blobs of one image transfer concurrently, capped per image and by
//! a batch-wide semaphore shared across all in-flight images. Every
//! transfer observes the cancellation token and returns promptly with
//! [`Error::Cancelled`] when it fires.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::CopyFunction;
use crate::client::RegistryClient;
use crate::constants::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, MAX_BATCH_DOWNLOADS, MAX_LAYER_DOWNLOADS_PER_IMAGE,
    OCI_INDEX_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use crate::image::{ImageRef, Transport};
use crate::manifest::{Descriptor, OciIndex, OciManifest};

/// Options shared by every copy in a batch.
#[derive(Clone)]
pub struct CopyOptions {
    /// Cooperative cancellation; checked between blob transfers.
    pub cancel: CancellationToken,
    /// Batch-wide cap on concurrent blob transfers.
    pub batch_permits: Arc<Semaphore>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            batch_permits: Arc::new(Semaphore::new(MAX_BATCH_DOWNLOADS)),
        }
    }
}

impl CopyOptions {
    fn check_cancelled(&self, context: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(context.to_string()));
        }
        Ok(())
    }
}

/// The image copy primitive.
pub struct Copier {
    client: Arc<RegistryClient>,
}

impl Copier {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }

    /// Copies (or deletes) one image.
    pub async fn run(
        &self,
        source: &str,
        destination: &str,
        function: CopyFunction,
        opts: &CopyOptions,
    ) -> Result<()> {
        opts.check_cancelled(source)?;

        if function == CopyFunction::Delete {
            let dest = ImageRef::parse(destination)?;
            info!("deleting {}", destination);
            return self.client.delete_manifest(&dest).await;
        }

        let src = ImageRef::parse(source)?;
        let dest = ImageRef::parse(destination)?;
        debug!("copy {} -> {}", source, destination);

        match (src.transport, dest.transport) {
            (Transport::Docker | Transport::None, Transport::Docker | Transport::None) => {
                self.registry_to_registry(&src, &dest, opts).await
            }
            (Transport::Docker | Transport::None, Transport::Oci | Transport::Dir) => {
                self.registry_to_layout(&src, Path::new(&dest.name), opts)
                    .await
            }
            (Transport::Oci | Transport::Dir, Transport::Docker | Transport::None) => {
                self.layout_to_registry(Path::new(&src.name), &dest, opts)
                    .await
            }
            _ => Err(Error::CopyFailed {
                source_ref: source.to_string(),
                destination: destination.to_string(),
                reason: "unsupported transport combination".to_string(),
            }),
        }
    }

    // =========================================================================
    // Registry to Registry
    // =========================================================================

    async fn registry_to_registry(
        &self,
        src: &ImageRef,
        dest: &ImageRef,
        opts: &CopyOptions,
    ) -> Result<()> {
        let top = self.client.get_manifest(src).await?;

        if top.media_type == OCI_INDEX_MEDIA_TYPE
            || top.media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
        {
            let index: OciIndex =
                serde_json::from_slice(&top.bytes).map_err(|e| Error::Format {
                    context: src.to_string(),
                    reason: e.to_string(),
                })?;
            for child in &index.manifests {
                opts.check_cancelled(&src.to_string())?;
                let fetched = self.client.get_manifest_ref(src, &child.digest).await?;
                self.copy_manifest_blobs(src, dest, &fetched.bytes, opts)
                    .await?;
                let media_type = if child.media_type.is_empty() {
                    fetched.media_type.clone()
                } else {
                    child.media_type.clone()
                };
                self.client
                    .put_manifest(dest, &child.digest, &media_type, fetched.bytes)
                    .await?;
            }
        } else {
            self.copy_manifest_blobs(src, dest, &top.bytes, opts).await?;
        }

        // The top manifest goes last so the destination never exposes a
        // manifest whose blobs are incomplete.
        let reference = dest
            .digest
            .clone()
            .or_else(|| dest.tag.clone())
            .unwrap_or_else(|| top.digest.clone());
        self.client
            .put_manifest(dest, &reference, &top.media_type, top.bytes)
            .await
    }

    /// Transfers the config and layer blobs of one (non-index) manifest.
    async fn copy_manifest_blobs(
        &self,
        src: &ImageRef,
        dest: &ImageRef,
        manifest_bytes: &[u8],
        opts: &CopyOptions,
    ) -> Result<()> {
        let manifest: OciManifest =
            serde_json::from_slice(manifest_bytes).map_err(|e| Error::Format {
                context: src.to_string(),
                reason: e.to_string(),
            })?;

        let mut blobs: Vec<Descriptor> = manifest.layers.clone();
        blobs.push(manifest.config.clone());

        stream::iter(blobs.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(MAX_LAYER_DOWNLOADS_PER_IMAGE, |blob| {
                let client = Arc::clone(&self.client);
                let opts = opts.clone();
                let src = src.clone();
                let dest = dest.clone();
                async move {
                    let _permit = tokio::select! {
                        permit = opts.batch_permits.acquire() => {
                            permit.map_err(|_| Error::Cancelled(src.to_string()))?
                        }
                        _ = opts.cancel.cancelled() => {
                            return Err(Error::Cancelled(src.to_string()));
                        }
                    };
                    if client.has_blob(&dest, &blob.digest).await.unwrap_or(false) {
                        debug!("blob {} already at destination", blob.digest);
                        return Ok(());
                    }
                    let data = tokio::select! {
                        data = client.get_blob(&src, &blob.digest) => data?,
                        _ = opts.cancel.cancelled() => {
                            return Err(Error::Cancelled(src.to_string()));
                        }
                    };
                    client.put_blob(&dest, &blob.digest, data).await
                }
            })
            .await
    }

    // =========================================================================
    // Registry to OCI Layout
    // =========================================================================

    async fn registry_to_layout(
        &self,
        src: &ImageRef,
        layout: &Path,
        opts: &CopyOptions,
    ) -> Result<()> {
        fs::create_dir_all(layout.join("blobs").join("sha256"))
            .map_err(|e| Error::io(format!("creating layout {}", layout.display()), e))?;
        fs::write(
            layout.join("oci-layout"),
            br#"{"imageLayoutVersion": "1.0.0"}"#,
        )
        .map_err(|e| Error::io("writing oci-layout".to_string(), e))?;

        let top = self.client.get_manifest(src).await?;

        if top.media_type == OCI_INDEX_MEDIA_TYPE
            || top.media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
        {
            let index: OciIndex =
                serde_json::from_slice(&top.bytes).map_err(|e| Error::Format {
                    context: src.to_string(),
                    reason: e.to_string(),
                })?;
            for child in &index.manifests {
                opts.check_cancelled(&src.to_string())?;
                let fetched = self.client.get_manifest_ref(src, &child.digest).await?;
                self.pull_manifest_blobs(src, layout, &fetched.bytes, opts)
                    .await?;
                write_layout_blob(layout, &child.digest, &fetched.bytes)?;
            }
        } else {
            self.pull_manifest_blobs(src, layout, &top.bytes, opts).await?;
        }

        write_layout_blob(layout, &top.digest, &top.bytes)?;

        let index = OciIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: vec![Descriptor {
                media_type: top.media_type.clone(),
                digest: top.digest.clone(),
                size: top.bytes.len() as u64,
                annotations: None,
            }],
        };
        let index_bytes = serde_json::to_vec(&index).map_err(|e| Error::Format {
            context: layout.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(layout.join("index.json"), index_bytes)
            .map_err(|e| Error::io("writing index.json".to_string(), e))?;
        Ok(())
    }

    async fn pull_manifest_blobs(
        &self,
        src: &ImageRef,
        layout: &Path,
        manifest_bytes: &[u8],
        opts: &CopyOptions,
    ) -> Result<()> {
        let manifest: OciManifest =
            serde_json::from_slice(manifest_bytes).map_err(|e| Error::Format {
                context: src.to_string(),
                reason: e.to_string(),
            })?;
        let mut blobs = manifest.layers.clone();
        blobs.push(manifest.config.clone());

        stream::iter(blobs.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(MAX_LAYER_DOWNLOADS_PER_IMAGE, |blob| {
                let client = Arc::clone(&self.client);
                let opts = opts.clone();
                let src = src.clone();
                let layout = layout.to_path_buf();
                async move {
                    if layout_blob_exists(&layout, &blob.digest) {
                        return Ok(());
                    }
                    let _permit = opts
                        .batch_permits
                        .acquire()
                        .await
                        .map_err(|_| Error::Cancelled(src.to_string()))?;
                    let data = tokio::select! {
                        data = client.get_blob(&src, &blob.digest) => data?,
                        _ = opts.cancel.cancelled() => {
                            return Err(Error::Cancelled(src.to_string()));
                        }
                    };
                    write_layout_blob(&layout, &blob.digest, &data)
                }
            })
            .await
    }

    // =========================================================================
    // OCI Layout to Registry
    // =========================================================================

    async fn layout_to_registry(
        &self,
        layout: &Path,
        dest: &ImageRef,
        opts: &CopyOptions,
    ) -> Result<()> {
        let index = crate::manifest::read_index(layout)?;
        let top = index.manifests.first().ok_or_else(|| Error::Format {
            context: layout.display().to_string(),
            reason: "image index has no manifests".to_string(),
        })?;

        let manifest_bytes = read_layout_blob(layout, &top.digest)?;
        let manifest: OciManifest =
            serde_json::from_slice(&manifest_bytes).map_err(|e| Error::Format {
                context: layout.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut blobs = manifest.layers.clone();
        blobs.push(manifest.config.clone());
        for blob in &blobs {
            opts.check_cancelled(&dest.to_string())?;
            let data = read_layout_blob(layout, &blob.digest)?;
            self.client.put_blob(dest, &blob.digest, data).await?;
        }

        let reference = dest
            .digest
            .clone()
            .or_else(|| dest.tag.clone())
            .unwrap_or_else(|| top.digest.clone());
        let media_type = if top.media_type.is_empty() {
            crate::constants::OCI_MANIFEST_MEDIA_TYPE.to_string()
        } else {
            top.media_type.clone()
        };
        self.client
            .put_manifest(dest, &reference, &media_type, manifest_bytes)
            .await
    }
}

// =============================================================================
// Layout Helpers
// =============================================================================

fn layout_blob_path(layout: &Path, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    layout.join("blobs").join("sha256").join(hex)
}

fn layout_blob_exists(layout: &Path, digest: &str) -> bool {
    layout_blob_path(layout, digest).exists()
}

fn write_layout_blob(layout: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = layout_blob_path(layout, digest);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(&path, data).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

fn read_layout_blob(layout: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = layout_blob_path(layout, digest);
    fs::read(&path).map_err(|_| Error::BlobNotFound {
        digest: digest.to_string(),
    })
}
