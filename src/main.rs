use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use respool::config::{ConfigError, Environment, ResourceConfig};
use respool::core::Core;
use respool::pool::SupervisorSignal;

/// Configuration could not be resolved (sysexits EX_CONFIG)
const EXIT_CONFIG: i32 = 78;
/// The datastore pool hit an unrecoverable fault (sysexits EX_SOFTWARE)
const EXIT_POOL_FATAL: i32 = 70;
/// A required cache link permanently failed (sysexits EX_OSERR)
const EXIT_CACHE_DOWN: i32 = 71;

#[derive(Parser)]
#[command(name = "respool")]
#[command(version, about = "Resource connection manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Deployment environment (development, production, test)
    #[arg(long, global = true, env = "APP_ENV", default_value = "development")]
    env: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resource manager until interrupted or a fatal fault
    Run {
        /// Seconds to wait for in-use connections during shutdown
        #[arg(long, default_value = "10")]
        drain_timeout: u64,
    },

    /// Resolve and print the effective configuration, then exit
    CheckConfig {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let environment: Environment = match cli.env.parse() {
        Ok(env) => env,
        Err(e) => return config_failure(e),
    };
    let config = match ResourceConfig::resolve(environment) {
        Ok(config) => Arc::new(config),
        Err(e) => return config_failure(e),
    };
    info!(environment = %environment, "configuration resolved");

    match cli.command {
        Commands::CheckConfig { format } => check_config(&config, format),
        Commands::Run { drain_timeout } => {
            run(config, Duration::from_secs(drain_timeout)).await
        }
    }
}

fn config_failure(e: ConfigError) -> Result<()> {
    error!("{}", e);
    std::process::exit(EXIT_CONFIG);
}

fn check_config(config: &ResourceConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => {
            println!("environment:  {}", config.environment);
            println!(
                "database:     {} (pool {} / idle {:?} / tls {:?})",
                config.database.addr(),
                config.database.pool_size,
                config.database.idle_timeout,
                config.database.tls,
            );
            println!(
                "cache:        {} ({})",
                config.cache.addr(),
                if config.cache.required { "required" } else { "optional" },
            );
            println!(
                "retry:        base {:?}, cap {:?}, budget {:?}/{} attempts",
                config.retry.base_unit,
                config.retry.max_delay,
                config.retry.max_elapsed,
                config.retry.max_attempts,
            );
            println!(
                "storage:      {}",
                match &config.storage {
                    Some(s) => format!("bucket {} in {}", s.bucket, s.region),
                    None => "disabled".to_string(),
                },
            );
            println!(
                "payment:      {}",
                match &config.payment {
                    Some(p) => p.api_base.clone(),
                    None => "disabled".to_string(),
                },
            );
        }
    }
    Ok(())
}

async fn run(config: Arc<ResourceConfig>, drain_timeout: Duration) -> Result<()> {
    let (core, mut supervisor) = Core::new(config)?;
    info!("resource manager running, press ctrl-c to stop");

    let exit_reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break None;
            }
            signal = supervisor.next() => match signal {
                Some(SupervisorSignal::PoolFatal { detail }) => {
                    error!(%detail, "datastore pool is unrecoverable");
                    break Some(EXIT_POOL_FATAL);
                }
                Some(SupervisorSignal::PermanentFailure { resource, detail }) => {
                    if core.cache_required() {
                        error!(resource, %detail, "required resource permanently failed");
                        break Some(EXIT_CACHE_DOWN);
                    }
                    warn!(resource, %detail, "optional resource permanently failed, continuing degraded");
                }
                // All signal senders dropped; nothing left to supervise.
                None => break None,
            },
        }
    };

    core.shutdown(drain_timeout).await;
    if let Some(code) = exit_reason {
        std::process::exit(code);
    }
    Ok(())
}
