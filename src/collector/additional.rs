//! Additional-images collector: a pass-through over user-named images.

use async_trait::async_trait;
use tracing::debug;

use crate::api::{CopyImage, ImageType, Mode};
use crate::config::AdditionalImage;
use crate::error::Result;
use crate::image::ImageRef;

use super::{Collector, CollectorContext};

pub struct AdditionalCollector {
    context: CollectorContext,
    images: Vec<AdditionalImage>,
}

impl AdditionalCollector {
    pub fn new(context: CollectorContext, images: Vec<AdditionalImage>) -> Self {
        Self { context, images }
    }
}

#[async_trait]
impl Collector for AdditionalCollector {
    async fn collect(&self) -> Result<Vec<CopyImage>> {
        let mut out = Vec::with_capacity(self.images.len());
        for entry in &self.images {
            let image = ImageRef::parse(&entry.name)?;
            let (source, destination) = match self.context.mode {
                Mode::DiskToMirror => (
                    self.context.cache_source(&image),
                    self.context.remote_destination(&image),
                ),
                Mode::MirrorToMirror => (
                    image.reference_with_transport(),
                    self.context.remote_destination(&image),
                ),
                Mode::Delete => (
                    self.context.cache_source(&image),
                    self.context.delete_reference(&image),
                ),
                _ => (
                    image.reference_with_transport(),
                    self.context.cache_destination(&image),
                ),
            };
            debug!("additional image {} -> {}", source, destination);
            out.push(CopyImage {
                origin: entry.name.clone(),
                source,
                destination,
                image_type: ImageType::Generic,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context(mode: Mode) -> CollectorContext {
        CollectorContext {
            mode,
            working_dir: PathBuf::from("/tmp/work"),
            cache_fqdn: "localhost:55000".to_string(),
            destination: "docker://dst.example".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mirror_to_disk_targets_cache() {
        let collector = AdditionalCollector::new(
            context(Mode::MirrorToDisk),
            vec![AdditionalImage {
                name: "registry.example/ns/img:latest".into(),
            }],
        );
        let images = collector.collect().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].source, "registry.example/ns/img:latest");
        assert_eq!(images[0].destination, "docker://localhost:55000/ns/img:latest");
        assert_eq!(images[0].image_type, ImageType::Generic);
    }

    #[tokio::test]
    async fn test_disk_to_mirror_reads_cache() {
        let collector = AdditionalCollector::new(
            context(Mode::DiskToMirror),
            vec![AdditionalImage {
                name: "registry.example/ns/img:latest".into(),
            }],
        );
        let images = collector.collect().await.unwrap();
        assert_eq!(images[0].source, "docker://localhost:55000/ns/img:latest");
        assert_eq!(images[0].destination, "docker://dst.example/ns/img:latest");
    }

    #[tokio::test]
    async fn test_invalid_reference_fails_fast() {
        let collector = AdditionalCollector::new(
            context(Mode::MirrorToDisk),
            vec![AdditionalImage {
                name: "not a reference".into(),
            }],
        );
        assert!(collector.collect().await.is_err());
    }
}
