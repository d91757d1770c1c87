use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rstor::config::{AppConfig, ArchiveFormat};
use rstor::context::AppContext;
use rstor::core::volumes::VolumeRegistry;
use rstor::core::{BackupRestoreEngine, PartitionSelection};
use rstor::errors::StorageError;
use rstor::ui::{ConsoleUi, SilentUi, UiAdapter};
use rstor::{flash, logging};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rstor")]
#[command(about = "Recovery storage and backup engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// CLI layer merged over the config file and environment.
#[derive(Args, Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    backup_format: Option<ArchiveFormat>,

    /// Forced 3-letter archive tag (e.g. "tgz").
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    forced_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verify_digest: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the device to a directory (timestamp-named by default).
    Backup(BackupArgs),
    /// Restore a previously taken backup.
    Restore(RestoreArgs),
    /// Stream one partition to stdout.
    Dump { partition: String },
    /// Rebuild one partition from stdin.
    Undump { partition: String },
}

#[derive(Args)]
struct BackupArgs {
    #[arg(long)]
    dest: Option<PathBuf>,

    #[arg(long)]
    skip_boot: bool,
    #[arg(long)]
    skip_system: bool,
    #[arg(long)]
    skip_data: bool,
    #[arg(long)]
    skip_cache: bool,
    #[arg(long)]
    skip_sdext: bool,
    #[arg(long)]
    skip_wimax: bool,
}

#[derive(Args)]
struct RestoreArgs {
    path: PathBuf,

    #[arg(long)]
    skip_boot: bool,
    #[arg(long)]
    skip_system: bool,
    #[arg(long)]
    skip_data: bool,
    #[arg(long)]
    skip_cache: bool,
    #[arg(long)]
    skip_sdext: bool,
    /// WiMAX is opt-in on restore; a bad image loses the radio keys.
    #[arg(long)]
    wimax: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(Some(&cli.overrides))?;
    logging::init(&config);

    let registry = VolumeRegistry::load(&config.volume_table);
    let flash = flash::toolkit(config.simulation);

    let ui: Arc<dyn UiAdapter> = match &cli.command {
        // Stream transfers own stdout; keep the console quiet.
        Commands::Dump { .. } | Commands::Undump { .. } => Arc::new(SilentUi),
        _ => Arc::new(ConsoleUi::new(Duration::from_millis(
            config.progress_interval_ms,
        ))),
    };

    let ctx = AppContext::new(config, registry, flash, ui);
    let mut engine = BackupRestoreEngine::new(ctx.clone());

    let result = match &cli.command {
        Commands::Backup(args) => {
            let dest = match &args.dest {
                Some(dest) => dest.clone(),
                None => ctx
                    .registry
                    .timestamped_backup_path()
                    .context("no primary storage declared; pass --dest")?,
            };
            let selection = PartitionSelection {
                boot: !args.skip_boot,
                system: !args.skip_system,
                data: !args.skip_data,
                cache: !args.skip_cache,
                sdext: !args.skip_sdext,
                wimax: !args.skip_wimax,
            };
            engine.backup(&dest, &selection).await
        }
        Commands::Restore(args) => {
            let selection = PartitionSelection {
                boot: !args.skip_boot,
                system: !args.skip_system,
                data: !args.skip_data,
                cache: !args.skip_cache,
                sdext: !args.skip_sdext,
                wimax: args.wimax,
            };
            engine.restore(&args.path, &selection).await
        }
        Commands::Dump { partition } => engine.dump(partition).await,
        Commands::Undump { partition } => engine.undump(partition).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(StorageError::Cancelled) => std::process::exit(2),
        Err(e) => Err(e).context("Job failed"),
    }
}
