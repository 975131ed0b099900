//! Platform release collector.
//!
//! MirrorToDisk resolves the configured channels through the update graph,
//! pulls each payload into an OCI layout, extracts
//! `release-manifests/image-references`, and emits the payload plus every
//! image it references. The update-graph answer is persisted under
//! `release-filters/` so DiskToMirror can re-identify the same releases
//! without network access.
//!
//! When the platform config requests the graph image, a synthetic
//! single-layer image wrapping the graph-data tarball is built and pushed
//! into the cache.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::api::{CopyFunction, CopyImage, ImageType, Mode, RelatedImage};
use crate::cincinnati::CincinnatiClient;
use crate::client::RegistryClient;
use crate::config::PlatformConfig;
use crate::constants::{
    DOCKER_LAYER_MEDIA_TYPE_GZIP, DOCKER_PROTOCOL, GRAPH_IMAGE_NAME, HOLD_RELEASE_SUBDIR,
    IMAGE_REFERENCES_FILE, OCI_CONFIG_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE, OCI_PROTOCOL,
    RELEASE_FILTERS_SUBDIR, RELEASE_IMAGES_SUBDIR, RELEASE_MANIFESTS_DIR,
};
use crate::copier::{Copier, CopyOptions};
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::manifest;

use super::{Collector, CollectorContext};

/// Path the graph-data tarball occupies inside the synthetic image.
const GRAPH_DATA_PATH: &str = "var/lib/cincinnati-graph-data.tar.gz";

/// Persisted update-graph answer, reused by DiskToMirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReleasesForFilter {
    filter: PlatformConfig,
    releases: Vec<PersistedRelease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRelease {
    source: String,
    version: String,
}

pub struct ReleaseCollector {
    context: CollectorContext,
    platform: Option<PlatformConfig>,
    copier: Arc<Copier>,
    copy_opts: CopyOptions,
    cincinnati: CincinnatiClient,
    client: Arc<RegistryClient>,
}

impl ReleaseCollector {
    pub fn new(
        context: CollectorContext,
        platform: Option<PlatformConfig>,
        copier: Arc<Copier>,
        copy_opts: CopyOptions,
        cincinnati: CincinnatiClient,
        client: Arc<RegistryClient>,
    ) -> Self {
        Self {
            context,
            platform,
            copier,
            copy_opts,
            cincinnati,
            client,
        }
    }

    fn payload_dir_name(source: &str) -> String {
        let last = source.rsplit('/').next().unwrap_or(source);
        last.replace(':', "/").replace('@', "/")
    }

    fn layout_dir(&self, source: &str) -> PathBuf {
        self.context
            .working_dir
            .join(RELEASE_IMAGES_SUBDIR)
            .join(Self::payload_dir_name(source))
    }

    fn hold_dir(&self, source: &str) -> PathBuf {
        self.context
            .working_dir
            .join(HOLD_RELEASE_SUBDIR)
            .join(Self::payload_dir_name(source))
    }

    fn filters_dir(&self) -> PathBuf {
        self.context.working_dir.join(RELEASE_FILTERS_SUBDIR)
    }

    /// Filter-file name: hash of the serialized platform filter.
    fn filter_file_name(filter: &PlatformConfig) -> String {
        let serialized = serde_json::to_string(filter).unwrap_or_default();
        hex::encode(Sha256::digest(serialized.as_bytes()))[..32].to_string()
    }

    fn graph_image_ref(&self) -> String {
        format!(
            "{}{}/{}:latest",
            DOCKER_PROTOCOL, self.context.cache_fqdn, GRAPH_IMAGE_NAME
        )
    }

    /// Mode-appropriate copy entry for one release-related image.
    fn to_copy_image(&self, name: &str, image: &str, image_type: ImageType) -> Result<CopyImage> {
        let parsed = ImageRef::parse(image)?;
        let (source, destination) = match self.context.mode {
            Mode::DiskToMirror => (
                self.context.cache_source(&parsed),
                self.context.remote_destination(&parsed),
            ),
            Mode::MirrorToMirror => (
                parsed.reference_with_transport(),
                self.context.remote_destination(&parsed),
            ),
            Mode::Delete => (
                self.context.cache_source(&parsed),
                self.context.delete_reference(&parsed),
            ),
            _ => (
                parsed.reference_with_transport(),
                self.context.cache_destination(&parsed),
            ),
        };
        Ok(CopyImage {
            origin: name.to_string(),
            source,
            destination,
            image_type,
        })
    }

    // =========================================================================
    // MirrorToDisk
    // =========================================================================

    async fn collect_from_graph(&self, platform: &PlatformConfig) -> Result<Vec<CopyImage>> {
        let releases = self.cincinnati.release_reference_images(platform).await?;
        let mut out = Vec::new();
        let mut persisted = Vec::new();

        for release in &releases {
            let layout = self.layout_dir(&release.source);
            let hold = self.hold_dir(&release.source);
            persisted.push(PersistedRelease {
                source: release.source.clone(),
                version: release.version.clone(),
            });

            if !layout.join("index.json").exists() {
                info!("copying release payload {}", release.source);
                fs::create_dir_all(&layout)
                    .map_err(|e| Error::io(format!("creating {}", layout.display()), e))?;
                let src = ImageRef::parse(&release.source)?.reference_with_transport();
                let dest = format!("{}{}", OCI_PROTOCOL, layout.display());
                self.copier
                    .run(&src, &dest, CopyFunction::Copy, &self.copy_opts)
                    .await?;
            } else {
                debug!("release layout exists at {}", layout.display());
            }

            let index = manifest::read_index(&layout)?;
            let desc = index.manifests.first().ok_or_else(|| Error::Format {
                context: layout.display().to_string(),
                reason: "release layout has no manifests".to_string(),
            })?;
            let payload_manifest = manifest::read_manifest(&layout, &desc.digest)?;
            manifest::extract_layers(&layout, &payload_manifest, RELEASE_MANIFESTS_DIR, &hold)?;

            let references = hold.join(RELEASE_MANIFESTS_DIR).join(IMAGE_REFERENCES_FILE);
            let related = manifest::read_release_schema(&references)?;
            debug!(
                "release {} references {} image(s)",
                release.source,
                related.len()
            );

            for img in related {
                out.push(self.to_copy_image(&img.name, &img.image, ImageType::OcpReleaseContent)?);
            }
            out.push(self.to_copy_image(
                &release.source,
                &release.source,
                ImageType::OcpRelease,
            )?);
        }

        self.save_releases_for_filter(platform, persisted)?;

        if platform.graph && self.context.mode != Mode::Prepare {
            info!("creating graph data image");
            let graph_ref = self.create_graph_image().await?;
            info!("graph image created and pushed to cache");
            out.push(CopyImage {
                origin: graph_ref.clone(),
                source: graph_ref.clone(),
                destination: graph_ref,
                image_type: ImageType::CincinnatiGraph,
            });
        }

        Ok(out)
    }

    fn save_releases_for_filter(
        &self,
        filter: &PlatformConfig,
        releases: Vec<PersistedRelease>,
    ) -> Result<()> {
        let dir = self.filters_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        let path = dir.join(Self::filter_file_name(filter));
        let payload = serde_json::to_vec(&ReleasesForFilter {
            filter: filter.clone(),
            releases,
        })
        .map_err(|e| Error::Format {
            context: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&path, payload)
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        debug!("saved update-graph answer to {}", path.display());
        Ok(())
    }

    // =========================================================================
    // DiskToMirror
    // =========================================================================

    async fn collect_from_disk(&self, platform: &PlatformConfig) -> Result<Vec<CopyImage>> {
        let path = self.filters_dir().join(Self::filter_file_name(platform));
        let data = fs::read(&path).map_err(|_| {
            Error::NotFound(format!(
                "release filter cache {} (was mirror-to-disk run with the same config?)",
                path.display()
            ))
        })?;
        let persisted: ReleasesForFilter =
            serde_json::from_slice(&data).map_err(|e| Error::Format {
                context: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut related: Vec<(RelatedImage, ImageType)> = Vec::new();
        for release in &persisted.releases {
            related.push((
                RelatedImage {
                    name: release.source.clone(),
                    image: release.source.clone(),
                },
                ImageType::OcpRelease,
            ));
            let references = self
                .hold_dir(&release.source)
                .join(RELEASE_MANIFESTS_DIR)
                .join(IMAGE_REFERENCES_FILE);
            for img in manifest::read_release_schema(&references)? {
                related.push((img, ImageType::OcpReleaseContent));
            }
        }

        if platform.graph {
            info!("adding graph data image");
            // Mirror-to-disk stored the graph image under :latest.
            related.push((
                RelatedImage {
                    name: GRAPH_IMAGE_NAME.to_string(),
                    image: format!("{}/{}:latest", self.context.cache_fqdn, GRAPH_IMAGE_NAME),
                },
                ImageType::CincinnatiGraph,
            ));
        }

        let mut out = Vec::new();
        for (img, image_type) in related {
            out.push(self.to_copy_image(&img.name, &img.image, image_type)?);
        }
        Ok(out)
    }

    // =========================================================================
    // Graph Image
    // =========================================================================

    /// Builds the synthetic graph image: one gzip layer carrying the
    /// graph-data tarball, pushed straight into the cache registry.
    async fn create_graph_image(&self) -> Result<String> {
        let graph_data = self.cincinnati.graph_data().await?;

        // layer: a tar holding the tarball at its well-known path
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_size(graph_data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, GRAPH_DATA_PATH, graph_data.as_slice())
                .map_err(|e| Error::io("building graph layer".to_string(), e))?;
            builder
                .finish()
                .map_err(|e| Error::io("finishing graph layer".to_string(), e))?;
        }
        let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&tar_bytes)));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&tar_bytes)
            .map_err(|e| Error::io("compressing graph layer".to_string(), e))?;
        let layer = encoder
            .finish()
            .map_err(|e| Error::io("compressing graph layer".to_string(), e))?;
        let layer_digest = format!("sha256:{}", hex::encode(Sha256::digest(&layer)));

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [diff_id] },
        });
        let config_bytes = serde_json::to_vec(&config).expect("static config serializes");
        let config_digest = format!("sha256:{}", hex::encode(Sha256::digest(&config_bytes)));

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": OCI_CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": DOCKER_LAYER_MEDIA_TYPE_GZIP,
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).expect("static manifest serializes");

        let graph_ref = self.graph_image_ref();
        let image = ImageRef::parse(&graph_ref)?;
        self.client.put_blob(&image, &layer_digest, layer).await?;
        self.client
            .put_blob(&image, &config_digest, config_bytes)
            .await?;
        self.client
            .put_manifest(&image, "latest", OCI_MANIFEST_MEDIA_TYPE, manifest_bytes)
            .await?;
        Ok(graph_ref)
    }
}

#[async_trait]
impl Collector for ReleaseCollector {
    async fn collect(&self) -> Result<Vec<CopyImage>> {
        let Some(platform) = &self.platform else {
            return Ok(Vec::new());
        };
        if platform.channels.is_empty() && !platform.graph {
            return Ok(Vec::new());
        }
        match self.context.mode {
            // Delete-generate also works from the on-disk artifacts.
            Mode::DiskToMirror | Mode::Delete => self.collect_from_disk(platform).await,
            _ => self.collect_from_graph(platform).await,
        }
    }
}
