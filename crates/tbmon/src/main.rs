//! tbmon - Sensor telemetry agent
//!
//! Reads local and remote sensors and publishes their values to a ThingsBoard
//! server, caching readings on disk while the server is unreachable.

mod logging;
mod runner;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use runner::{RunMode, Runner};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tbmon_cloud::{CacheStore, DeliveryCoordinator, HttpPublisher, SqliteCacheStore};
use tbmon_core::{AgentConfig, ConfigLoader, LoadedConfig, AGENT_VERSION};
use tbmon_sources::SourceRegistry;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit status when one or more devices were rejected at load time
const EXIT_DEVICE_REJECTED: u8 = 2;

#[derive(Parser)]
#[command(name = "tbmon")]
#[command(version)]
#[command(about = "Sensor telemetry agent with offline caching", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TBMON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and publish sensor values (default)
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,

        /// Seconds between ticks, overriding agent.interval_secs (0 = single tick)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Validate the configuration and list devices
    Check,

    /// Show readings waiting in the offline cache
    Cache,

    /// Write a configuration skeleton
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Everything the device commands need after startup
struct Startup {
    loaded: LoadedConfig,
    registry: SourceRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        once: false,
        interval: None,
    });

    match command {
        Commands::Init { force } => init_command(cli.config, force),
        Commands::Run { once, interval } => {
            let startup = startup(cli.config, cli.verbose)?;
            run_command(startup, once, interval).await
        }
        Commands::Check => {
            let startup = startup(cli.config, cli.verbose)?;
            check_command(&startup)
        }
        Commands::Cache => {
            let startup = startup(cli.config, cli.verbose)?;
            cache_command(&startup)
        }
    }
}

/// Load and validate the configuration, set up logging, and reject devices
/// whose sensor kind cannot be served
fn startup(config_path: Option<PathBuf>, verbose: u8) -> anyhow::Result<Startup> {
    let mut loaded = ConfigLoader::new()
        .with_cli_path(config_path)
        .load()
        .context("Failed to load configuration")?;

    let agent = &loaded.agent;
    let level = logging::level_for(verbose, &agent.agent.log_level);
    let log_file = logging::init(&level, &agent.storage.log_dir)?;
    info!(
        "tbmon v{} starting, logging to {}",
        AGENT_VERSION,
        log_file.display()
    );

    let registry =
        SourceRegistry::with_defaults(agent).context("Failed to set up sensor readers")?;
    reject_unservable(&mut loaded, &registry);

    for rejected in &loaded.rejected {
        error!("{}", rejected.to_error());
    }
    if loaded.devices.is_empty() {
        warn!("No usable devices configured");
    }

    Ok(Startup { loaded, registry })
}

fn reject_unservable(loaded: &mut LoadedConfig, registry: &SourceRegistry) {
    loaded.reject_where(|device| registry.validate(device).map_err(|e| e.to_string()));
}

/// 0 when every device loaded, 2 when some were rejected. Global config
/// errors surface through `anyhow` and exit with 1.
fn exit_code(loaded: &LoadedConfig) -> u8 {
    if loaded.has_rejections() {
        EXIT_DEVICE_REJECTED
    } else {
        0
    }
}

fn exit_status(loaded: &LoadedConfig) -> ExitCode {
    ExitCode::from(exit_code(loaded))
}

async fn run_command(
    startup: Startup,
    once: bool,
    interval: Option<u64>,
) -> anyhow::Result<ExitCode> {
    let Startup { loaded, registry } = startup;
    let status = exit_status(&loaded);
    let config = Arc::new(loaded.agent);

    let cache = Arc::new(
        SqliteCacheStore::open(&config.storage.cache_dir).context("Failed to open offline cache")?,
    );
    let publisher =
        Arc::new(HttpPublisher::new(&config.connection).context("Failed to create publisher")?);
    info!("Publishing to {}", publisher.base_url());

    let coordinator = DeliveryCoordinator::new(
        publisher,
        cache,
        config.agent.read_timeout(),
        config.agent.max_replay_per_tick,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, finishing current device...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let mode = if once {
        RunMode::Once
    } else {
        match interval {
            Some(secs) => RunMode::Every(Duration::from_secs(secs)),
            None => RunMode::Configured,
        }
    };

    let mut runner = Runner::new(
        config.clone(),
        loaded.devices,
        registry,
        coordinator,
        shutdown_rx,
    );
    let summary = runner.run(mode).await;
    let stats = runner.coordinator().stats();

    info!(
        "Stopped after {} ticks: {} delivered, {} cached, {} replayed, {} skipped, {} failed",
        summary.ticks,
        summary.delivered,
        summary.cached,
        summary.replayed,
        summary.skipped,
        summary.failed
    );
    if stats.dropped > 0 || stats.rejected > 0 {
        warn!(
            "{} readings dropped and {} rejected by the server",
            stats.dropped, stats.rejected
        );
    }

    Ok(status)
}

fn check_command(startup: &Startup) -> anyhow::Result<ExitCode> {
    let loaded = &startup.loaded;
    let agent = &loaded.agent;

    println!();
    println!("tbmon v{}", AGENT_VERSION);
    println!();
    println!("  Server:      {}", agent.connection.server);
    println!(
        "  Proxy:       {}",
        if agent.connection.proxy.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Cache dir:   {}", agent.storage.cache_dir.display());
    println!("  Log dir:     {}", agent.storage.log_dir.display());
    println!("  Sensor kinds: {}", startup.registry.kinds().join(", "));
    println!();
    println!("Devices ({} usable):", loaded.devices.len());

    for device in &loaded.devices {
        let settings = &device.settings;
        let mut flags = Vec::new();
        if !settings.active {
            flags.push("inactive");
        }
        if settings.local_only {
            flags.push("local-only");
        }
        if settings.cache_on_error {
            flags.push("cache-on-error");
        }
        if settings.clearcache {
            flags.push("clearcache");
        }
        if settings.sys_info {
            flags.push("sys-info");
        }
        println!(
            "  {}  {:<8} {:<30} {}",
            device.identity(),
            device.telemetry.kind,
            device.telemetry.target,
            flags.join(" ")
        );
    }

    if loaded.has_rejections() {
        println!();
        println!("Rejected:");
        for rejected in &loaded.rejected {
            println!("  #{}: {}", rejected.index, rejected.reason);
        }
    }
    println!();

    Ok(exit_status(loaded))
}

fn cache_command(startup: &Startup) -> anyhow::Result<ExitCode> {
    let loaded = &startup.loaded;
    let cache = SqliteCacheStore::open(&loaded.agent.storage.cache_dir)
        .context("Failed to open offline cache")?;
    let stats = cache.stats().context("Failed to read cache statistics")?;

    if stats.is_empty() {
        println!("Offline cache is empty");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<14} {:<10} {:>8} {:>8}  {:<25} {:<25}",
        "DEVICE", "KIND", "PENDING", "RETRIES", "OLDEST", "NEWEST"
    );
    for entry in &stats {
        let kind = loaded
            .devices
            .iter()
            .find(|d| d.identity() == entry.device)
            .map(|d| d.telemetry.kind.as_str())
            .unwrap_or("-");
        let format_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<14} {:<10} {:>8} {:>8}  {:<25} {:<25}",
            entry.device,
            kind,
            entry.pending,
            entry.max_retries,
            format_time(entry.oldest),
            format_time(entry.newest)
        );
    }

    Ok(ExitCode::SUCCESS)
}

const EXAMPLE_DEVICE: &str = r#"
# [[devices]]
# authkey = "YOUR_DEVICE_ACCESS_TOKEN"
#
# [devices.settings]
# active = true
# cache_on_error = true
# sys_info = false
#
# [devices.attributes]
# location = "attic"
#
# [devices.telemetry]
# kind = "ds18b20"
# target = "/sys/bus/w1/devices/28-000005e2fdc3/w1_slave"
# label = "attic"
"#;

fn init_command(config_path: Option<PathBuf>, force: bool) -> anyhow::Result<ExitCode> {
    let path = match config_path.or_else(ConfigLoader::default_config_path) {
        Some(path) => path,
        None => bail!("Cannot determine a config location; pass --config"),
    };

    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    ConfigLoader::save(&AgentConfig::default(), &path)?;
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)?
        .write_all(EXAMPLE_DEVICE.as_bytes())?;

    println!("Wrote configuration skeleton to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(content: &str) -> LoadedConfig {
        let mut loaded = ConfigLoader::parse(content).unwrap();
        let registry = SourceRegistry::with_defaults(&loaded.agent).unwrap();
        reject_unservable(&mut loaded, &registry);
        loaded
    }

    #[test]
    fn test_exit_code_all_devices_usable() {
        let loaded = loaded(
            r#"
            [[devices]]
            authkey = "HOST"
            [devices.telemetry]
            kind = "host"
            "#,
        );
        assert_eq!(exit_code(&loaded), 0);
    }

    #[test]
    fn test_exit_code_malformed_device() {
        let loaded = loaded(
            r#"
            [[devices]]
            authkey = "HOST"
            [devices.telemetry]
            kind = "host"

            [[devices]]
            authkey = "NO_TELEMETRY"
            "#,
        );
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(exit_code(&loaded), EXIT_DEVICE_REJECTED);
    }

    #[test]
    fn test_exit_code_unknown_kind() {
        let loaded = loaded(
            r#"
            [[devices]]
            authkey = "HOST"
            [devices.telemetry]
            kind = "host"

            [[devices]]
            authkey = "HUMIDITY"
            [devices.telemetry]
            kind = "bme280"
            "#,
        );
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.rejected[0].index, 1);
        assert_eq!(exit_code(&loaded), EXIT_DEVICE_REJECTED);
    }

    #[test]
    fn test_global_error_fails_load() {
        let result = ConfigLoader::parse(
            r#"
            [agent]
            log_level = "loud"
            "#,
        );
        assert!(result.is_err());
    }
}
