/*!
 * Tether CLI - operator commands against the local sandbox
 *
 * The long-running edge server lives in `tether-server`; these commands run
 * one supervisor, backup or cron operation and exit.
 */

use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::presets;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use std::path::PathBuf;
use std::sync::Arc;
use tether::{
    config::LogLevel,
    error::{Result, TetherError, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS},
    logging, BackupSynchronizer, CliJobRegistry, GatewayStatus, HealthOutcome, LocalHost,
    Reconciler, Supervisor, TetherConfig,
};
use tether_host_interface::SandboxHost;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Supervise a sandboxed gateway and its durable state", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/tether/tether.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write logs to a file instead of stdout
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make sure the configured gateway is running and answering
    Ensure,

    /// Kill every gateway process and start a fresh one
    Restart,

    /// Show the gateway process and fingerprint state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Probe the running gateway; restart it if it stopped answering
    Health,

    /// Mirror gateway state into the mounted bucket
    Sync,

    /// Copy the last backup back into the gateway state tree
    Restore,

    /// Register any configured scheduled jobs missing from the gateway
    Reconcile,

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Target path (default: ~/.config/tether/tether.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {}", hint);
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    // `config init` must work before a valid config exists
    if let Commands::Config(ConfigCommands::Init { path, force }) = &cli.command {
        return init_config(path.clone(), *force).map(|_| EXIT_SUCCESS);
    }

    let mut config = TetherConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    config.logging.verbose = config.logging.verbose || cli.verbose;
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }
    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| TetherError::Config(format!("Failed to start async runtime: {}", e)))?;
    runtime.block_on(handle_command(cli.command, config))
}

async fn handle_command(command: Commands, config: TetherConfig) -> Result<i32> {
    let host: Arc<dyn SandboxHost> = Arc::new(LocalHost::new());
    let supervisor = Supervisor::new(
        host.clone(),
        config.gateway.clone(),
        config.supervisor.clone(),
    );

    match command {
        Commands::Ensure => {
            let handle = supervisor.ensure(&config.gateway).await?;
            println!("Gateway running as {} ({})", handle.id(), handle.command());
            Ok(EXIT_SUCCESS)
        }
        Commands::Restart => {
            let handle = supervisor.restart().await?;
            println!("Gateway restarted as {}", handle.id());
            Ok(EXIT_SUCCESS)
        }
        Commands::Status { json } => {
            let status = supervisor.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status_table(&status));
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Health => match supervisor.check_health().await? {
            HealthOutcome::NotRunning => {
                println!("No gateway running");
                Ok(EXIT_SUCCESS)
            }
            HealthOutcome::Healthy => {
                println!("Gateway healthy");
                Ok(EXIT_SUCCESS)
            }
            HealthOutcome::WithinGrace => {
                println!("Gateway not answering, but started recently; left alone");
                Ok(EXIT_SUCCESS)
            }
            HealthOutcome::Restarted(id) => {
                println!("Gateway was unhealthy and has been restarted as {}", id);
                Ok(EXIT_SUCCESS)
            }
            HealthOutcome::RestartFailed(reason) => {
                eprintln!("Gateway restart failed: {}", reason);
                Ok(EXIT_FATAL)
            }
        },
        Commands::Sync => {
            let sync = BackupSynchronizer::new(host, config.backup.clone());
            let marker = sync.source_marker();
            let timestamp = sync.sync().await?.into_result(&marker)?;
            println!("Backup synced at {}", timestamp);
            Ok(EXIT_SUCCESS)
        }
        Commands::Restore => {
            let sync = BackupSynchronizer::new(host, config.backup.clone());
            if sync.restore().await? {
                println!("Gateway state restored from backup");
            } else {
                println!("No usable backup found; nothing restored");
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Reconcile => {
            let Some(handle) = supervisor.current().await? else {
                eprintln!("No gateway running; start it with `tether ensure` first");
                return Ok(EXIT_PARTIAL);
            };
            let registry = Arc::new(CliJobRegistry::new(
                host,
                config.gateway.binary.clone(),
                &config.cron,
            ));
            let report = Reconciler::new(registry)
                .reconcile(&handle, &config.cron.jobs)
                .await?;
            if report.restored {
                println!("Restored job registry from snapshot");
            }
            for name in &report.added {
                println!("Added job {}", name);
            }
            for name in &report.failed {
                eprintln!("Failed to register job {}", name);
            }
            if !report.failed.is_empty() {
                return Ok(EXIT_PARTIAL);
            }
            if !report.changed() {
                println!("All {} jobs already registered", report.already_present.len());
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Config(ConfigCommands::Init { .. }) => Ok(EXIT_SUCCESS),
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path
        .or_else(TetherConfig::default_path)
        .ok_or_else(|| TetherError::Config("No config directory available".to_string()))?;
    if path.exists() && !force {
        return Err(TetherError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    TetherConfig::default().to_file(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn status_table(status: &GatewayStatus) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let gateway = match status.gateway {
        Some(ref info) => format!("{} ({})", info.id, info.status),
        None => "not running".to_string(),
    };
    let since_start = status
        .since_last_start
        .map(|d| format!("{}s ago", d.as_secs()))
        .unwrap_or_else(|| "-".to_string());

    let rows = [
        ("Gateway", gateway),
        ("Desired fingerprint", status.desired_fingerprint.clone()),
        (
            "Stored fingerprint",
            status.stored_fingerprint.clone().unwrap_or_else(|| "-".to_string()),
        ),
        (
            "Fingerprint matches",
            if status.fingerprint_matches { "yes" } else { "no" }.to_string(),
        ),
        ("Gateway processes", status.gateway_processes.to_string()),
        ("Auxiliary processes", status.auxiliary_processes.to_string()),
        ("Zombie processes", status.zombie_processes.to_string()),
        ("Last start", since_start),
    ];
    for (key, value) in rows {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value).add_attribute(Attribute::Bold),
        ]);
    }
    table
}
