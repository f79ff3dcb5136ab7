use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dynaprobe::{CheckRegistry, DefinitionStore, PassConfig, PassScheduler};
use logger::LogFormat;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

mod config;
mod definitions;
mod sinks;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "dynaprobe", version)]
#[command(about = "Run templated protocol health checks on a fixed cadence")]
struct Args {
    /// Config file, created with defaults when missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Definitions file, overrides `definitions.path` from the config
    #[arg(short, long)]
    definitions: Option<PathBuf>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_path) = Config::from_config(args.config.as_ref()).context("failed to load configuration")?;
    if args.print_config {
        println!("{config}");
        return Ok(());
    }

    logger::init_with(&config.logging.level, Some(LogFormat::from_name(&config.logging.format)));

    let definitions_path = args.definitions.unwrap_or_else(|| config.definitions_path(&config_path));
    let store = DefinitionStore::new(
        definitions::load(&definitions_path).context("failed to load check definitions")?,
    );
    info!("Loaded {} check definitions from {}", store.len(), definitions_path.display());

    let shutdown = CancellationToken::new();
    let pass_config = PassConfig {
        check_timeout: config.scheduler.check_timeout(),
        connect_timeout: config.scheduler.connect_timeout(),
        event_type: config.output.event_type.clone(),
    };
    let scheduler = Arc::new(
        PassScheduler::new(Arc::new(CheckRegistry::default()), sinks::publisher(config.output.sink), pass_config)
            .with_shutdown(shutdown.clone()),
    );

    if args.once {
        let summary = scheduler.run(&store).await;
        if summary.published < summary.total {
            error!("{} of {} results were not published", summary.total - summary.published, summary.total);
        }
        return Ok(());
    }

    let passes = TaskTracker::new();
    let mut ticker = interval(config.scheduler.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Running checks every {} seconds", config.scheduler.period().as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                definitions::refresh(&store, &definitions_path);

                let scheduler = scheduler.clone();
                let store = store.clone();
                passes.spawn(async move {
                    scheduler.run(&store).await;
                });
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                info!("Shutting down, waiting for {} running passes", passes.len());
                break;
            }
        }
    }

    passes.close();
    tokio::select! {
        _ = passes.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Cancelling running checks");
            shutdown.cancel();
            passes.wait().await;
        }
    }

    Ok(())
}
