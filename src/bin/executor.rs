//! Executor worker: submits orders, monitors fills, attaches protective
//! stops, and halts trading on persistent broker failure.

use std::sync::Arc;

use clap::Parser;
use signal_engine::broker::{Broker, RestBroker};
use signal_engine::cadence::{self, PASSIVE_SECONDS};
use signal_engine::config::{current_sleep_mode, Config};
use signal_engine::executor::{self, CircuitBreaker};
use signal_engine::models::LogLevel;
use signal_engine::store::Store;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const MONITOR_PULSE_SECONDS: i64 = 5;

#[derive(Parser, Debug)]
#[command(name = "executor")]
#[command(about = "Submits SIZED signals to the broker and monitors fills")]
struct Args {
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    once: bool,
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = Config::from_env()?;
    let store = Store::open(&config.database_path)?;
    let breaker = CircuitBreaker::new();

    let credentials_present = config.broker_key_id.as_deref().is_some_and(|v| !v.is_empty())
        && config.broker_secret_key.as_deref().is_some_and(|v| !v.is_empty())
        && !config.broker_base_url.is_empty();
    if !credentials_present {
        breaker.trip_immediately();
        error!("broker credentials missing (BROKER_KEY_ID/BROKER_SECRET_KEY/BROKER_BASE_URL), tripping circuit breaker at startup");
        store
            .log(
                "executor",
                LogLevel::Critical,
                "broker credentials missing at startup, circuit breaker tripped",
            )
            .await?;
    }

    let broker: Arc<dyn Broker> = Arc::new(RestBroker::new(
        config.broker_base_url.clone(),
        config.broker_key_id.clone().unwrap_or_default(),
        config.broker_secret_key.clone().unwrap_or_default(),
    )?);

    info!("starting executor");

    loop {
        if breaker.is_tripped() {
            error!("circuit breaker tripped, sleeping 300s before checking again");
            if args.once {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(PASSIVE_SECONDS as u64 / 12)) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
            continue;
        }

        let still_submitted = match executor::run_cycle(&store, broker.as_ref(), &breaker, &config).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "executor cycle failed");
                false
            }
        };

        if args.once {
            return Ok(());
        }

        let mode = current_sleep_mode(&store).await;
        let sleep_secs = if still_submitted {
            MONITOR_PULSE_SECONDS
        } else {
            cadence::sleep_seconds(chrono::Utc::now(), mode)
        };

        tokio::select! {
            _ = cadence::smart_sleep(sleep_secs, || { mode }) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}
