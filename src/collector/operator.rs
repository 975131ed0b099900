//! Operator catalog collector.
//!
//! For each configured catalog: pull the catalog image into an OCI layout
//! (once; layouts are reused across runs), extract its declarative-config
//! tree, filter bundles against the package selectors, and emit the
//! catalog image plus every selected bundle and related image.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::api::{CopyImage, ImageType, Mode};
use crate::catalog::Catalog;
use crate::config::OperatorConfig;
use crate::constants::{
    HOLD_OPERATOR_SUBDIR, OCI_PROTOCOL, OPERATOR_IMAGES_SUBDIR,
};
use crate::copier::{Copier, CopyOptions};
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::manifest;

use super::{Collector, CollectorContext};

pub struct OperatorCollector {
    context: CollectorContext,
    operators: Vec<OperatorConfig>,
    copier: Arc<Copier>,
    copy_opts: CopyOptions,
}

impl OperatorCollector {
    pub fn new(
        context: CollectorContext,
        operators: Vec<OperatorConfig>,
        copier: Arc<Copier>,
        copy_opts: CopyOptions,
    ) -> Self {
        Self {
            context,
            operators,
            copier,
            copy_opts,
        }
    }

    /// Directory name for a catalog: last path component with the tag
    /// folded in (`operator-index/v4.15`).
    fn catalog_dir_name(catalog: &str) -> String {
        let last = catalog.rsplit('/').next().unwrap_or(catalog);
        last.replace(':', "/").replace('@', "/")
    }

    fn layout_dir(&self, catalog: &str) -> PathBuf {
        self.context
            .working_dir
            .join(OPERATOR_IMAGES_SUBDIR)
            .join(Self::catalog_dir_name(catalog))
    }

    fn hold_dir(&self, catalog: &str) -> PathBuf {
        self.context
            .working_dir
            .join(HOLD_OPERATOR_SUBDIR)
            .join(Self::catalog_dir_name(catalog))
    }

    /// Ensures the catalog layout exists on disk, pulling it when absent.
    async fn ensure_layout(&self, catalog: &str) -> Result<PathBuf> {
        let layout = self.layout_dir(catalog);
        if layout.join("index.json").exists() {
            debug!("catalog layout exists at {}", layout.display());
            return Ok(layout);
        }
        if matches!(self.context.mode, Mode::DiskToMirror | Mode::Delete) {
            // These modes work from the artifacts already on disk; a
            // missing layout means the archive was incomplete.
            return Err(Error::NotFound(format!(
                "catalog layout {} (was the archive extracted?)",
                layout.display()
            )));
        }
        info!("copying operator catalog {}", catalog);
        fs::create_dir_all(&layout)
            .map_err(|e| Error::io(format!("creating {}", layout.display()), e))?;
        let src = ImageRef::parse(catalog)?.reference_with_transport();
        let dest = format!("{}{}", OCI_PROTOCOL, layout.display());
        self.copier
            .run(&src, &dest, crate::api::CopyFunction::Copy, &self.copy_opts)
            .await?;
        Ok(layout)
    }

    /// Builds the copy entry for one selected image.
    fn to_copy_image(&self, name: &str, image: &str, image_type: ImageType) -> Result<CopyImage> {
        let parsed = ImageRef::parse(image)?;
        let (source, destination) = match self.context.mode {
            Mode::DiskToMirror => {
                let src = if parsed.is_by_digest() {
                    // stored under a truncated-digest tag during mirror-to-disk
                    format!(
                        "docker://{}/{}:{}",
                        self.context.cache_fqdn,
                        parsed.path_component(),
                        parsed.digest_truncated().expect("digest present"),
                    )
                } else {
                    self.context.cache_source(&parsed)
                };
                let dest = if parsed.is_by_digest() {
                    format!(
                        "{}/{}:{}",
                        self.context.destination.trim_end_matches('/'),
                        parsed.path_component(),
                        parsed.digest_truncated().expect("digest present"),
                    )
                } else {
                    self.context.remote_destination(&parsed)
                };
                (src, dest)
            }
            Mode::MirrorToMirror => (
                parsed.reference_with_transport(),
                self.context.remote_destination(&parsed),
            ),
            Mode::Delete => {
                let reference = match parsed.digest_truncated() {
                    Some(tag) => format!("{}:{}", parsed.path_component(), tag),
                    None => self.context.delete_reference(&parsed),
                };
                (
                    format!("docker://{}/{}", self.context.cache_fqdn, reference),
                    reference,
                )
            }
            _ => (
                parsed.reference_with_transport(),
                self.context.cache_destination_truncated(&parsed),
            ),
        };
        Ok(CopyImage {
            origin: name.to_string(),
            source,
            destination,
            image_type,
        })
    }
}

#[async_trait]
impl Collector for OperatorCollector {
    async fn collect(&self) -> Result<Vec<CopyImage>> {
        let mut out: Vec<CopyImage> = Vec::new();

        for op in &self.operators {
            info!("collecting operator catalog {}", op.catalog);
            let layout = self.ensure_layout(&op.catalog).await?;
            let hold = self.hold_dir(&op.catalog);
            fs::create_dir_all(&hold)
                .map_err(|e| Error::io(format!("creating {}", hold.display()), e))?;

            let configs_dir = manifest::extract_catalog_configs(&layout, &hold)?;
            let catalog = Catalog::load(&configs_dir)?;

            let selected = if op.packages.is_empty() {
                catalog.filter_all()?
            } else {
                let mut all = Vec::new();
                for pkg in &op.packages {
                    all.extend(catalog.filter_package(pkg, op.full)?);
                }
                all
            };
            debug!(
                "catalog {}: {} image(s) selected",
                op.catalog,
                selected.len()
            );

            for img in &selected {
                let image_type = if img.is_bundle {
                    ImageType::OperatorBundle
                } else {
                    ImageType::OperatorRelatedImage
                };
                out.push(self.to_copy_image(&img.name, &img.image, image_type)?);
            }

            // The catalog image itself is always mirrored.
            out.push(self.to_copy_image(&op.catalog, &op.catalog, ImageType::OperatorCatalog)?);
        }

        // Dedup across catalogs by (source, destination); first wins.
        let mut seen = std::collections::HashSet::new();
        out.retain(|img| seen.insert((img.source.clone(), img.destination.clone())));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_dir_name() {
        assert_eq!(
            OperatorCollector::catalog_dir_name("registry.example/redhat/operator-index:v4.15"),
            "operator-index/v4.15"
        );
        assert_eq!(
            OperatorCollector::catalog_dir_name("idx:v1"),
            "idx/v1"
        );
    }
}
