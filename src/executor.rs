//! Mode orchestrator.
//!
//! Validates the (source, destination) tuple into a run mode before any
//! state mutation, then drives the per-mode sequence:
//!
//! - MirrorToDisk: start cache, collect, batch-copy into the cache, stop
//!   cache, build the archive
//! - DiskToMirror: extract the archive, start cache, collect from on-disk
//!   artifacts, optionally rewrite destinations for nesting limits,
//!   batch-copy, emit the image mapping for downstream renderers
//! - MirrorToMirror: start cache, collect, batch-copy straight to the
//!   destination
//! - Delete generate/execute: the two halves of the delete contract
//! - Prepare: verify cache completeness without mutating anything
//!
//! The embedded registry is torn down on every exit path, success or not.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::api::{CollectorSchema, CopyFunction, Mode};
use crate::archive::{ArchiveBuilder, ArchiveExtractor};
use crate::batch::Batch;
use crate::blobgather::BlobGatherer;
use crate::cache::{start_registry, CacheStore, RunningRegistry};
use crate::cincinnati::CincinnatiClient;
use crate::client::RegistryClient;
use crate::collector::additional::AdditionalCollector;
use crate::collector::operator::OperatorCollector;
use crate::collector::release::ReleaseCollector;
use crate::collector::{rewrite_max_nested_paths, Collector, CollectorContext};
use crate::config::{DeleteImageSetConfig, ImageSetConfig, MirrorConfig};
use crate::constants::{
    CLUSTER_RESOURCES_SUBDIR, DOCKER_PROTOCOL, FILE_PROTOCOL, LOGS_SUBDIR, WORKING_DIR,
};
use crate::copier::{Copier, CopyOptions};
use crate::delete::DeletePipeline;
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::signature;
use crate::transport;

/// Everything a run needs, assembled from the CLI surface.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Destination argument (`file://<dir>` or `docker://<registry>`).
    pub destination: String,
    /// `--from file://<dir>` for DiskToMirror.
    pub from: Option<String>,
    /// Cache registry loopback port.
    pub port: u16,
    /// Assets subdirectory name (the `file://` workspace).
    pub dir: Option<String>,
    /// Strict archive chunking.
    pub strict_archive: bool,
    /// Remove cache blobs during delete execute.
    pub force_cache_delete: bool,
    /// Destination nesting limit; 0 disables rewriting.
    pub max_nested_paths: usize,
    /// Incremental archive cutoff date.
    pub since: Option<chrono::NaiveDate>,
    /// Delete metadata version discriminator.
    pub delete_id: Option<String>,
    /// Explicit delete YAML (execute mode).
    pub delete_yaml_file: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            destination: String::new(),
            from: None,
            port: crate::constants::DEFAULT_CACHE_PORT,
            dir: None,
            strict_archive: false,
            force_cache_delete: false,
            max_nested_paths: 0,
            since: None,
            delete_id: None,
            delete_yaml_file: None,
        }
    }
}

/// Validates the (destination, --from) tuple into a mirror mode.
///
/// Rejections happen here, before any directory or cache is touched.
pub fn validate_mirror_mode(destination: &str, from: Option<&str>) -> Result<Mode> {
    if destination.starts_with(FILE_PROTOCOL) {
        if from.is_some() {
            return Err(Error::Validation(
                "--from cannot be combined with a file:// destination".to_string(),
            ));
        }
        return Ok(Mode::MirrorToDisk);
    }
    if destination.starts_with(DOCKER_PROTOCOL) {
        return match from {
            Some(from) if from.starts_with(FILE_PROTOCOL) => Ok(Mode::DiskToMirror),
            Some(other) => Err(Error::Validation(format!(
                "--from must use the file:// prefix, got '{}'",
                other
            ))),
            None => Ok(Mode::MirrorToMirror),
        };
    }
    Err(Error::Validation(format!(
        "destination '{}' must use the file:// or docker:// prefix",
        destination
    )))
}

/// The orchestrator. One instance drives one run.
pub struct Executor {
    config: ImageSetConfig,
    opts: ExecutorOptions,
}

struct Runtime {
    workspace: PathBuf,
    working_dir: PathBuf,
    cache_store: CacheStore,
    registry: Option<RunningRegistry>,
    cache_fqdn: String,
    client: Arc<RegistryClient>,
    copier: Arc<Copier>,
    copy_opts: CopyOptions,
}

impl Runtime {
    /// Stops the embedded registry, leaving the cache tree quiescent.
    /// Safe to call more than once.
    async fn stop_registry(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.stop().await;
        }
    }
}

impl Executor {
    pub fn new(config: ImageSetConfig, opts: ExecutorOptions) -> Self {
        Self { config, opts }
    }

    /// Runs the mirror command (MirrorToDisk / DiskToMirror /
    /// MirrorToMirror / Prepare).
    pub async fn run(&self, mode: Mode) -> Result<()> {
        let mut runtime = self.setup(mode).await?;
        let result = self.run_inner(mode, &mut runtime).await;
        runtime.stop_registry().await;
        match &result {
            Ok(()) => info!("{:?} completed successfully", mode),
            Err(e) => warn!("{:?} failed: {}", mode, e),
        }
        result
    }

    /// Resolves the workspace root from the destination / --from argument.
    fn workspace(&self, mode: Mode) -> Result<PathBuf> {
        let raw = match mode {
            Mode::DiskToMirror | Mode::Prepare => {
                self.opts.from.as_deref().ok_or_else(|| {
                    Error::Validation("--from is required for this mode".to_string())
                })?
            }
            _ => self.opts.destination.as_str(),
        };
        let path = raw.strip_prefix(FILE_PROTOCOL).unwrap_or(raw);
        let mut workspace = PathBuf::from(path);
        if let Some(dir) = &self.opts.dir {
            workspace = workspace.join(dir);
        }
        Ok(workspace)
    }

    async fn setup(&self, mode: Mode) -> Result<Runtime> {
        let workspace = self.workspace(mode)?;
        let working_dir = workspace.join(WORKING_DIR);
        let cache_store = CacheStore::open(CacheStore::default_root())?;

        // DiskToMirror replays the archive before anything reads the cache
        // or the working directory.
        if mode == Mode::DiskToMirror {
            ArchiveExtractor::new(
                workspace.clone(),
                cache_store.root().to_path_buf(),
                working_dir.clone(),
            )
            .extract()?;
        }

        let logs_dir = working_dir.join(LOGS_SUBDIR);
        fs::create_dir_all(&logs_dir)
            .map_err(|e| Error::io(format!("creating {}", logs_dir.display()), e))?;
        let signatures_dir = working_dir.join(crate::constants::SIGNATURES_SUBDIR);
        fs::create_dir_all(&signatures_dir)
            .map_err(|e| Error::io(format!("creating {}", signatures_dir.display()), e))?;

        let registry = start_registry(
            cache_store.clone(),
            self.opts.port,
            Some(logs_dir.join("registry.log")),
        )
        .await?;
        let cache_fqdn = registry.fqdn.clone();

        if mode != Mode::Prepare {
            let cache_url = format!("{}{}", DOCKER_PROTOCOL, cache_fqdn);
            signature::set_registry_configuration(
                &working_dir,
                &cache_url,
                &self.opts.destination,
            )?;
        }

        let client = Arc::new(RegistryClient::new(transport::load_mirrors()?)?);
        let copier = Arc::new(Copier::new(Arc::clone(&client)));

        Ok(Runtime {
            workspace,
            working_dir,
            cache_store,
            registry: Some(registry),
            cache_fqdn,
            client,
            copier,
            copy_opts: CopyOptions::default(),
        })
    }

    fn collector_context(&self, mode: Mode, runtime: &Runtime) -> CollectorContext {
        CollectorContext {
            mode,
            working_dir: runtime.working_dir.clone(),
            cache_fqdn: runtime.cache_fqdn.clone(),
            destination: self.opts.destination.clone(),
        }
    }

    /// Runs all three collectors and merges their output in release,
    /// operator, additional order.
    async fn collect(&self, mode: Mode, runtime: &Runtime) -> Result<CollectorSchema> {
        self.collect_config(&self.config.mirror, mode, runtime).await
    }

    async fn collect_config(
        &self,
        mirror: &MirrorConfig,
        mode: Mode,
        runtime: &Runtime,
    ) -> Result<CollectorSchema> {
        let context = self.collector_context(mode, runtime);
        let mut schema = CollectorSchema::default();

        let release = ReleaseCollector::new(
            context.clone(),
            mirror.platform.clone(),
            Arc::clone(&runtime.copier),
            runtime.copy_opts.clone(),
            CincinnatiClient::new()?,
            Arc::clone(&runtime.client),
        );
        schema.extend(release.collect().await?);

        let operator = OperatorCollector::new(
            context.clone(),
            mirror.operators.clone(),
            Arc::clone(&runtime.copier),
            runtime.copy_opts.clone(),
        );
        schema.extend(operator.collect().await?);

        let additional =
            AdditionalCollector::new(context, mirror.additional_images.clone());
        schema.extend(additional.collect().await?);

        info!("collected {} image(s) to process", schema.len());
        Ok(schema)
    }

    async fn run_inner(&self, mode: Mode, runtime: &mut Runtime) -> Result<()> {
        match mode {
            Mode::MirrorToDisk => self.mirror_to_disk(runtime).await,
            Mode::DiskToMirror => self.disk_to_mirror(runtime).await,
            Mode::MirrorToMirror => self.mirror_to_mirror(runtime).await,
            Mode::Prepare => self.prepare(runtime).await,
            Mode::Delete => Err(Error::Validation(
                "delete runs through the delete subcommand".to_string(),
            )),
        }
    }

    // =========================================================================
    // MirrorToDisk
    // =========================================================================

    async fn mirror_to_disk(&self, runtime: &mut Runtime) -> Result<()> {
        let schema = self.collect(Mode::MirrorToDisk, runtime).await?;
        let batch = Batch::new(
            Arc::clone(&runtime.copier),
            runtime.working_dir.join(LOGS_SUBDIR),
        );
        // fail-safe errors still produce an archive of what copied
        let batch_result = match batch
            .worker(
                &schema,
                CopyFunction::Copy,
                Mode::MirrorToDisk,
                &runtime.copy_opts,
            )
            .await
        {
            Ok(copied) => Ok(copied),
            Err(Error::SafeBatch(msg)) => {
                warn!("{}", msg);
                Err(Error::SafeBatch(msg))
            }
            Err(e) => return Err(e),
        };

        // The blob tree must be quiescent before the archive walks it.
        runtime.stop_registry().await;

        let config_yaml = serde_yaml::to_string(&self.config).map_err(|e| Error::Format {
            context: "image set config".to_string(),
            reason: e.to_string(),
        })?;
        let chunks = ArchiveBuilder::new(
            runtime.workspace.clone(),
            runtime.cache_store.root().to_path_buf(),
            runtime.working_dir.clone(),
            self.config.archive_size_bytes(),
            self.opts.strict_archive,
        )
        .with_since(self.opts.since)
        .build(&config_yaml)?;
        info!("archive ready: {} chunk(s)", chunks.len());

        batch_result.map(|_| ())
    }

    // =========================================================================
    // DiskToMirror
    // =========================================================================

    async fn disk_to_mirror(&self, runtime: &mut Runtime) -> Result<()> {
        let mut schema = self.collect(Mode::DiskToMirror, runtime).await?;
        if self.opts.max_nested_paths > 0 {
            rewrite_max_nested_paths(&mut schema.all_images, self.opts.max_nested_paths)?;
        }
        let batch = Batch::new(
            Arc::clone(&runtime.copier),
            runtime.working_dir.join(LOGS_SUBDIR),
        );
        let copied = batch
            .worker(
                &schema,
                CopyFunction::Copy,
                Mode::DiskToMirror,
                &runtime.copy_opts,
            )
            .await?;
        self.emit_mapping(runtime, &copied)?;
        Ok(())
    }

    /// Writes the final image mapping consumed by downstream
    /// cluster-resource renderers (IDMS/ITMS/CatalogSource generation).
    fn emit_mapping(&self, runtime: &Runtime, copied: &CollectorSchema) -> Result<()> {
        let dir = runtime.working_dir.join(CLUSTER_RESOURCES_SUBDIR);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        let path = dir.join("mapping.txt");
        let mut contents = String::new();
        for img in &copied.all_images {
            let origin = img.origin.trim_start_matches(DOCKER_PROTOCOL);
            let destination = img.destination.trim_start_matches(DOCKER_PROTOCOL);
            contents.push_str(&format!("{}={}\n", origin, destination));
        }
        fs::write(&path, contents)
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        info!("image mapping written to {}", path.display());
        Ok(())
    }

    // =========================================================================
    // MirrorToMirror
    // =========================================================================

    async fn mirror_to_mirror(&self, runtime: &mut Runtime) -> Result<()> {
        let mut schema = self.collect(Mode::MirrorToMirror, runtime).await?;
        if self.opts.max_nested_paths > 0 {
            rewrite_max_nested_paths(&mut schema.all_images, self.opts.max_nested_paths)?;
        }
        let batch = Batch::new(
            Arc::clone(&runtime.copier),
            runtime.working_dir.join(LOGS_SUBDIR),
        );
        batch
            .worker(
                &schema,
                CopyFunction::Copy,
                Mode::MirrorToMirror,
                &runtime.copy_opts,
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    /// Dry verification: every collected image must already resolve in
    /// the cache. Nothing is mutated.
    async fn prepare(&self, runtime: &mut Runtime) -> Result<()> {
        let schema = self.collect(Mode::Prepare, runtime).await?;
        let mut missing = Vec::new();
        for img in &schema.all_images {
            let cache_ref = ImageRef::parse(&img.destination)?;
            if cache_ref.registry != runtime.cache_fqdn {
                // only cache-destined entries are verifiable here
                continue;
            }
            let reference = cache_ref
                .digest
                .clone()
                .or_else(|| cache_ref.tag.clone())
                .unwrap_or_default();
            if runtime
                .cache_store
                .resolve_manifest(&cache_ref.path_component(), &reference)
                .is_none()
            {
                missing.push(img.origin.clone());
            }
        }
        if missing.is_empty() {
            info!("cache is complete: {} image(s) verified", schema.len());
            Ok(())
        } else {
            for img in &missing {
                warn!("missing from cache: {}", img);
            }
            Err(Error::NotFound(format!(
                "{} of {} image(s) missing from the cache",
                missing.len(),
                schema.len()
            )))
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete generate: collect, gather blob closures, write the contract.
    pub async fn delete_generate(
        &self,
        delete_config: &DeleteImageSetConfig,
        source: &str,
    ) -> Result<()> {
        let opts = ExecutorOptions {
            from: Some(source.to_string()),
            ..self.opts.clone()
        };
        let executor = Executor {
            config: ImageSetConfig {
                kind: "ImageSetConfiguration".to_string(),
                api_version: delete_config.api_version.clone(),
                archive_size: None,
                mirror: delete_config.delete.clone(),
            },
            opts,
        };
        let mut runtime = executor.setup(Mode::Prepare).await?;
        let result = executor
            .delete_generate_inner(delete_config, &runtime)
            .await;
        runtime.stop_registry().await;
        result
    }

    async fn delete_generate_inner(
        &self,
        delete_config: &DeleteImageSetConfig,
        runtime: &Runtime,
    ) -> Result<()> {
        let schema = self
            .collect_config(delete_config.as_mirror(), Mode::Delete, runtime)
            .await?;
        let pipeline = DeletePipeline {
            working_dir: runtime.working_dir.clone(),
            cache: runtime.cache_store.clone(),
            delete_yaml_file: None,
            delete_id: self.opts.delete_id.clone(),
            force_cache_delete: false,
        };
        let gatherer = BlobGatherer::new(&runtime.client);
        let path = pipeline
            .write_delete_metadata(&schema.all_images, &gatherer, delete_config)
            .await?;
        info!("delete metadata written to {}", path.display());
        Ok(())
    }

    /// Delete execute: read the contract, optionally purge cache blobs,
    /// delete destination manifests.
    pub async fn delete_execute(&self, source: &str) -> Result<()> {
        if !self.opts.destination.starts_with(DOCKER_PROTOCOL) {
            return Err(Error::Validation(
                "delete requires a docker:// destination".to_string(),
            ));
        }
        let opts = ExecutorOptions {
            from: Some(source.to_string()),
            ..self.opts.clone()
        };
        let executor = Executor {
            config: self.config.clone(),
            opts,
        };
        let mut runtime = executor.setup(Mode::Prepare).await?;
        let result = executor.delete_execute_inner(&runtime).await;
        runtime.stop_registry().await;
        result
    }

    async fn delete_execute_inner(&self, runtime: &Runtime) -> Result<()> {
        let pipeline = DeletePipeline {
            working_dir: runtime.working_dir.clone(),
            cache: runtime.cache_store.clone(),
            delete_yaml_file: self.opts.delete_yaml_file.clone(),
            delete_id: self.opts.delete_id.clone(),
            force_cache_delete: self.opts.force_cache_delete,
        };
        // the contract is read before any mutation
        let list = pipeline.read_delete_metadata()?;
        if self.opts.force_cache_delete {
            pipeline.delete_cache_blobs(&list)?;
        }
        let batch = Batch::new(
            Arc::clone(&runtime.copier),
            runtime.working_dir.join(LOGS_SUBDIR),
        );
        pipeline
            .delete_registry_images(&list, &self.opts.destination, &batch, &runtime.copy_opts)
            .await?;
        Ok(())
    }
}
