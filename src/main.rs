use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use objgate::backend::TcpConnectionFactory;
use objgate::config::{CliConfig, LogLevel};
use objgate::{Config, Gateway};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "objgate";

const STATS_INTERVAL: Duration = Duration::from_secs(60);

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliConfig::from_args();

    // Tracing is not up yet, so config errors go straight to stderr.
    let config = match Config::load(&cli).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{APP_NAME}: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.log_level);
    run_until_shutdown(config).await;
    ExitCode::SUCCESS
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn init_tracing(level: LogLevel) {
    // OBJGATE_LOG already fed `level`; RUST_LOG directives win when present.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run_until_shutdown(config: Config) {
    let factory = TcpConnectionFactory::new(&config.settings.backend);
    let gateway = Gateway::new(&config.settings, factory, Arc::new(config.users));

    let warmed = gateway.warm().await;
    info!("{} started, {} connection(s) warm", APP_NAME, warmed);

    let mut ticker = interval(STATS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("failed to listen for shutdown signal: {e}");
                }
                info!("{} shutting down", APP_NAME);
                break;
            }

            _ = ticker.tick() => {
                let stats = gateway.stats();
                info!(
                    active = stats.pool.active,
                    idle = stats.pool.idle,
                    evicted = stats.pool.evicted,
                    sessions = stats.sessions,
                    cache_entries = stats.cache.entries,
                    cache_hits = stats.cache.hits,
                    cache_misses = stats.cache.misses,
                    "gateway stats"
                );
            }
        }
    }

    gateway.shutdown().await;
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
