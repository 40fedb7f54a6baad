//! Forecaster worker: produces the ensemble price forecast each cycle.

use std::sync::Arc;

use clap::Parser;
use signal_engine::cadence::{self, ACTIVE_SECONDS};
use signal_engine::config::{current_sleep_mode, Config};
use signal_engine::forecaster;
use signal_engine::store::Store;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "forecaster")]
#[command(about = "Produces an ensemble price forecast for every tracked symbol")]
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
    let store = Arc::new(Store::open(&config.database_path)?);
    let symbols = config.symbols_with_benchmark();

    info!(symbols = symbols.len(), "starting forecaster");

    loop {
        forecaster::run_cycle(store.clone(), &symbols).await;

        if args.once {
            return Ok(());
        }

        let mode = current_sleep_mode(&store).await;
        let sleep_secs = cadence::sleep_to_next_candle(chrono::Utc::now(), 300, 20)
            .min(cadence::sleep_seconds(chrono::Utc::now(), mode).max(ACTIVE_SECONDS));

        tokio::select! {
            _ = cadence::smart_sleep(sleep_secs, || { mode }) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}
