//! airlift CLI entry point.
//!
//! ```sh
//! airlift mirror file:///srv/mirror --config imageset.yaml
//! airlift mirror docker://dst.example --config imageset.yaml --from file:///srv/mirror
//! airlift delete --generate --config delete.yaml --source file:///srv/mirror --delete-id v1
//! airlift delete --delete-yaml-file d.yaml --destination docker://dst.example --source file:///srv/mirror
//! airlift prepare --config imageset.yaml --from file:///srv/mirror
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use airlift::config::{DeleteImageSetConfig, ImageSetConfig};
use airlift::constants::DEFAULT_CACHE_PORT;
use airlift::error::Error;
use airlift::executor::{validate_mirror_mode, Executor, ExecutorOptions};

/// airlift — disconnected-registry mirroring engine.
#[derive(Parser)]
#[command(name = "airlift", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

/// Flags shared by every command.
#[derive(Args, Clone)]
struct CommonArgs {
    /// Loopback port of the embedded cache registry
    #[arg(long, global = true, default_value_t = DEFAULT_CACHE_PORT)]
    port: u16,

    /// Assets subdirectory name under the file:// workspace
    #[arg(long, global = true)]
    dir: Option<String>,

    /// Log verbosity
    #[arg(long, global = true, default_value = "info",
          value_parser = ["error", "info", "debug", "trace"])]
    loglevel: String,

    /// Also remove blob files from the local cache during delete
    #[arg(long, global = true, default_value_t = false)]
    force_cache_delete: bool,

    /// Fail the archive build on files larger than the chunk size
    #[arg(long, global = true, default_value_t = false)]
    strict_archive: bool,

    /// Maximum repository nesting on the destination registry (0 = off)
    #[arg(long, global = true, default_value_t = 0)]
    max_nested_paths: usize,

    /// Only archive cache blobs modified on or after this date (YYYY-MM-DD)
    #[arg(long, global = true)]
    since: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror images to disk or to a destination registry
    Mirror(MirrorArgs),
    /// Generate or execute a delete of previously mirrored images
    Delete(DeleteArgs),
    /// Verify that the local cache holds everything the config needs
    Prepare(PrepareArgs),
}

#[derive(Args)]
struct MirrorArgs {
    /// Destination: file://<dir> or docker://<registry>
    destination: String,

    /// Image-set configuration file
    #[arg(long)]
    config: PathBuf,

    /// Source workspace (file://<dir>) for disk-to-mirror
    #[arg(long)]
    from: Option<String>,
}

#[derive(Args)]
struct DeleteArgs {
    /// Produce the delete metadata instead of executing a delete
    #[arg(long, default_value_t = false)]
    generate: bool,

    /// Delete image-set configuration (generate mode)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace holding the working directory (file://<dir>)
    #[arg(long)]
    source: String,

    /// Version discriminator appended to generated file names
    #[arg(long)]
    delete_id: Option<String>,

    /// Previously generated delete metadata file (execute mode)
    #[arg(long)]
    delete_yaml_file: Option<PathBuf>,

    /// Destination registry to delete from (execute mode)
    #[arg(long)]
    destination: Option<String>,
}

#[derive(Args)]
struct PrepareArgs {
    /// Image-set configuration file
    #[arg(long)]
    config: PathBuf,

    /// Workspace holding the cache artifacts (file://<dir>)
    #[arg(long)]
    from: String,
}

fn init_logging(loglevel: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("airlift={}", loglevel))),
        )
        .with_target(false)
        .init();
}

fn parse_since(raw: Option<&str>) -> Result<Option<chrono::NaiveDate>, Error> {
    match raw {
        None => Ok(None),
        Some(s) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| Error::Validation(format!("--since expects YYYY-MM-DD: {}", e))),
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let since = parse_since(cli.common.since.as_deref())?;

    match cli.command {
        Command::Mirror(args) => {
            let mode = validate_mirror_mode(&args.destination, args.from.as_deref())?;
            let config = ImageSetConfig::load(&args.config)?;
            let opts = ExecutorOptions {
                destination: args.destination,
                from: args.from,
                port: cli.common.port,
                dir: cli.common.dir,
                strict_archive: cli.common.strict_archive,
                force_cache_delete: cli.common.force_cache_delete,
                max_nested_paths: cli.common.max_nested_paths,
                since,
                ..Default::default()
            };
            Executor::new(config, opts).run(mode).await
        }
        Command::Prepare(args) => {
            let config = ImageSetConfig::load(&args.config)?;
            let opts = ExecutorOptions {
                destination: args.from.clone(),
                from: Some(args.from),
                port: cli.common.port,
                dir: cli.common.dir,
                ..Default::default()
            };
            Executor::new(config, opts).run(airlift::Mode::Prepare).await
        }
        Command::Delete(args) => {
            if args.generate {
                let config_path = args.config.ok_or_else(|| {
                    Error::Validation("--config is required with --generate".to_string())
                })?;
                let delete_config = DeleteImageSetConfig::load(&config_path)?;
                let opts = ExecutorOptions {
                    destination: String::new(),
                    port: cli.common.port,
                    dir: cli.common.dir,
                    delete_id: args.delete_id,
                    ..Default::default()
                };
                let executor = Executor::new(ImageSetConfig::default(), opts);
                executor.delete_generate(&delete_config, &args.source).await
            } else {
                let destination = args.destination.ok_or_else(|| {
                    Error::Validation("--destination is required to execute a delete".to_string())
                })?;
                let opts = ExecutorOptions {
                    destination,
                    port: cli.common.port,
                    dir: cli.common.dir,
                    force_cache_delete: cli.common.force_cache_delete,
                    delete_id: args.delete_id,
                    delete_yaml_file: args.delete_yaml_file,
                    ..Default::default()
                };
                let executor = Executor::new(ImageSetConfig::default(), opts);
                executor.delete_execute(&args.source).await
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.common.loglevel);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}
