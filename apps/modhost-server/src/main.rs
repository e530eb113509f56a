use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use modhost_bootstrap::{AppConfig, AppConfigProvider, CliArgs, ConfigProvider};

use std::path::{Path, PathBuf};
use std::sync::Arc;

mod scanner;
use scanner::ManifestScanner;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Adapter to make `AppConfigProvider` implement `modhost::ConfigProvider`.
struct ModhostConfigAdapter(Arc<AppConfigProvider>);

impl modhost::ConfigProvider for ModhostConfigAdapter {
    fn module_config(&self, module_name: &str) -> Option<serde_json::Value> {
        self.0.get_module_config(module_name).cloned()
    }
}

// Ensure module crates are linked so their activator entries register via
// inventory.
#[allow(dead_code)]
fn _ensure_modules_linked() {
    let _ = std::any::type_name::<heartbeat::ClockActivator>();
    let _ = std::any::type_name::<heartbeat::MonitorActivator>();
}

use modhost::{run, ModuleScanner, RunOptions, ShutdownOptions};

/// ModHost Server - in-process dynamic module runtime
#[derive(Parser)]
#[command(name = "modhost-server")]
#[command(about = "ModHost Server - in-process dynamic module runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Manifest directory override (overrides config)
    #[arg(short, long)]
    manifest_dir: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host
    Run,
    /// Validate configuration and manifests, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    _ensure_modules_linked();

    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        manifest_dir: cli
            .manifest_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (MODHOST__*) -> 4) CLI overrides
    // Also normalizes + creates server.home_dir.
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    modhost_bootstrap::logging::init_logging(
        &logging_config,
        Path::new(&config.server.home_dir),
    );

    tracing::info!("ModHost Server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_host(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_host(config: AppConfig) -> Result<()> {
    let manifest_dir = config.manifest_path();
    tracing::info!(dir = %manifest_dir.display(), "Discovering modules");

    // Bridge AppConfig into the runtime's ConfigProvider (per-module JSON bag).
    let config_provider = Arc::new(ModhostConfigAdapter(Arc::new(AppConfigProvider::new(
        config,
    ))));

    run(RunOptions {
        scanner: Box::new(ManifestScanner::new(manifest_dir)),
        modules_cfg: config_provider,
        shutdown: ShutdownOptions::Signals,
    })
    .await
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration");

    let manifest_dir = config.manifest_path();
    let scanner = ManifestScanner::new(&manifest_dir);

    let mut valid = 0usize;
    let mut invalid = 0usize;
    for result in scanner.find_modules() {
        match result {
            Ok(descriptor) => {
                valid += 1;
                if modhost::find_activator(&descriptor.entry_point).is_none() {
                    invalid += 1;
                    eprintln!(
                        "manifest '{}': unknown entry point '{}'",
                        descriptor.identity(),
                        descriptor.entry_point
                    );
                }
            }
            Err(err) => {
                invalid += 1;
                eprintln!("{err}: {}", err.source);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} invalid manifest(s) in {}", manifest_dir.display());
    }
    println!("Configuration is valid ({valid} manifest(s))");
    println!("{}", config.to_yaml()?);
    Ok(())
}
