//! Batch copier.
//!
//! Drives the copy primitive over a collector-produced image list,
//! tallying per-category progress and classifying failures:
//!
//! - a release image failure is **fatal**: the error log is written, the
//!   remaining copies are cancelled, and [`Error::UnsafeBatch`] is returned
//! - any other failure is recorded and the batch continues; at the end the
//!   accumulated errors are written to a timestamped log and surfaced as a
//!   single [`Error::SafeBatch`] with remediation guidance
//!
//! Cancellation surfaces like any other error and follows the same
//! classification.

use std::fs;
use std::path::PathBuf;

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info};

use crate::api::{CollectorSchema, CopyFunction, CopyImage, ImageCategory, Mode};
use crate::copier::{Copier, CopyOptions};
use crate::error::{Error, Result};

/// Per-category progress counters.
#[derive(Debug, Default, Clone)]
struct Progress {
    total: usize,
    errors: usize,
    release: usize,
    release_errors: usize,
    operator: usize,
    operator_errors: usize,
    additional: usize,
    additional_errors: usize,
}

/// One recorded failure.
#[derive(Debug)]
struct MirrorError {
    image: CopyImage,
    error: Error,
}

/// The batch worker.
pub struct Batch {
    copier: Arc<Copier>,
    logs_dir: PathBuf,
}

impl Batch {
    pub fn new(copier: Arc<Copier>, logs_dir: PathBuf) -> Self {
        Self { copier, logs_dir }
    }

    /// Processes every image of the schema. Returns the successfully
    /// copied subset on full or fail-safe completion.
    pub async fn worker(
        &self,
        schema: &CollectorSchema,
        function: CopyFunction,
        mode: Mode,
        opts: &CopyOptions,
    ) -> Result<CollectorSchema> {
        let verb = match function {
            CopyFunction::Copy => "copying",
            CopyFunction::Delete => "deleting",
        };
        info!("start {} the images...", verb);

        let mut copied = CollectorSchema::default();
        let mut progress = Progress::default();
        let mut errors: Vec<MirrorError> = Vec::new();

        for img in &schema.all_images {
            // The graph image is synthesized straight into the cache, so
            // disk-producing modes only tally it.
            if img.image_type == crate::api::ImageType::CincinnatiGraph
                && mode.is_disk_producing()
            {
                copied.extend(vec![img.clone()]);
                self.log_progress(verb, img, schema, &mut progress, None);
                continue;
            }

            let result = self
                .copier
                .run(&img.source, &img.destination, function, opts)
                .await;

            match result {
                Ok(()) => {
                    copied.extend(vec![img.clone()]);
                    self.log_progress(verb, img, schema, &mut progress, None);
                }
                Err(err) if !img.image_type.is_release() => {
                    // fail-safe: record and keep going
                    self.log_progress(verb, img, schema, &mut progress, Some(&err));
                    errors.push(MirrorError {
                        image: img.clone(),
                        error: err,
                    });
                }
                Err(err) => {
                    // fail-fast: a release image failed
                    let reason = err.to_string();
                    errors.push(MirrorError {
                        image: img.clone(),
                        error: err,
                    });
                    opts.cancel.cancel();
                    let log_file = self.save_errors(&errors)?;
                    info!("release image failure logged to {}", log_file.display());
                    return Err(Error::UnsafeBatch {
                        image: img.origin.clone(),
                        reason,
                    });
                }
            }
        }

        self.log_results(function, schema, &progress);

        if !errors.is_empty() {
            let log_file = self.save_errors(&errors)?;
            return Err(Error::SafeBatch(format!(
                "some errors occurred during the mirroring.\n\
                 \t Please review {} for a list of mirroring errors.\n\
                 \t You may consider:\n\
                 \t * removing images or operators that cause the error from the image set config, and retrying\n\
                 \t * keeping the image set config (images are mandatory for you), and retrying\n\
                 \t * mirroring the failing images manually, if retries also fail.",
                log_file.display()
            )));
        }

        Ok(copied)
    }

    fn log_progress(
        &self,
        verb: &str,
        img: &CopyImage,
        schema: &CollectorSchema,
        progress: &mut Progress,
        error: Option<&Error>,
    ) {
        match img.image_type.category() {
            ImageCategory::Release => progress.release += 1,
            ImageCategory::Operator => progress.operator += 1,
            ImageCategory::Additional => progress.additional += 1,
        }
        progress.total += 1;
        if error.is_some() {
            progress.errors += 1;
            match img.image_type.category() {
                ImageCategory::Release => progress.release_errors += 1,
                ImageCategory::Operator => progress.operator_errors += 1,
                ImageCategory::Additional => progress.additional_errors += 1,
            }
        }

        if progress.errors > 0 {
            info!(
                "=== overall progress - {} image {} / {} ({} errors) ===",
                verb,
                progress.total,
                schema.len(),
                progress.errors
            );
        } else {
            info!(
                "=== overall progress - {} image {} / {} ===",
                verb,
                progress.total,
                schema.len()
            );
        }
        if schema.total_release_images > 0 {
            info!(
                "{} release image {} / {}",
                verb, progress.release, schema.total_release_images
            );
        }
        if schema.total_operator_images > 0 {
            info!(
                "{} operator image {} / {}",
                verb, progress.operator, schema.total_operator_images
            );
        }
        if schema.total_additional_images > 0 {
            info!(
                "{} additional image {} / {}",
                verb, progress.additional, schema.total_additional_images
            );
        }
        info!(" image: {}", img.origin);
    }

    fn log_results(&self, function: CopyFunction, schema: &CollectorSchema, progress: &Progress) {
        info!("=== results ===");
        if function == CopyFunction::Delete {
            if progress.total == schema.len() && progress.total != 0 && progress.errors == 0 {
                info!("all images deleted successfully {} / {}", progress.total, schema.len());
            } else {
                info!(
                    "images deleted {} / {}: some images failed to delete - please check the logs",
                    progress.total - progress.errors,
                    schema.len()
                );
            }
            return;
        }
        if schema.total_release_images != 0 {
            if progress.release_errors == 0 {
                info!(
                    "all release images mirrored successfully {} / {}",
                    progress.release, schema.total_release_images
                );
            } else {
                info!(
                    "images mirrored {} / {}: some release images failed to mirror - please check the logs",
                    progress.release - progress.release_errors,
                    schema.total_release_images
                );
            }
        }
        if schema.total_operator_images != 0 {
            if progress.operator_errors == 0 {
                info!(
                    "all operator images mirrored successfully {} / {}",
                    progress.operator, schema.total_operator_images
                );
            } else {
                info!(
                    "images mirrored {} / {}: some operator images failed to mirror - please check the logs",
                    progress.operator - progress.operator_errors,
                    schema.total_operator_images
                );
            }
        }
        if schema.total_additional_images != 0 {
            if progress.additional_errors == 0 {
                info!(
                    "all additional images mirrored successfully {} / {}",
                    progress.additional, schema.total_additional_images
                );
            } else {
                info!(
                    "images mirrored {} / {}: some additional images failed to mirror - please check the logs",
                    progress.additional - progress.additional_errors,
                    schema.total_additional_images
                );
            }
        }
    }

    /// Writes one line per recorded failure to a timestamped file under
    /// the logs directory, returning its path.
    fn save_errors(&self, errors: &[MirrorError]) -> Result<PathBuf> {
        fs::create_dir_all(&self.logs_dir)
            .map_err(|e| Error::io(format!("creating {}", self.logs_dir.display()), e))?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.logs_dir.join(format!("mirroring_errors_{}.txt", timestamp));
        let mut contents = String::new();
        for entry in errors {
            contents.push_str(&format!(
                "error mirroring image {} error: {}\n",
                entry.image.origin, entry.error
            ));
        }
        fs::write(&path, contents)
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        debug!("wrote {} error(s) to {}", errors.len(), path.display());
        Ok(path)
    }
}
