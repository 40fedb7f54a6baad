//! Risk Manager worker: sizes PENDING signals and expires stale ones.

use std::sync::Arc;

use clap::Parser;
use signal_engine::cadence::{self, ACTIVE_SECONDS};
use signal_engine::config::{current_sleep_mode, Config};
use signal_engine::risk;
use signal_engine::store::Store;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "risk_manager")]
#[command(about = "Sizes PENDING signals and expires stale ones")]
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

    info!("starting risk manager");

    loop {
        if let Err(e) = risk::run_cycle(&store, &config).await {
            error!(error = %e, "risk cycle failed");
        }

        if args.once {
            return Ok(());
        }

        let mode = current_sleep_mode(&store).await;
        let sleep_secs = cadence::sleep_seconds(chrono::Utc::now(), mode).max(ACTIVE_SECONDS);

        tokio::select! {
            _ = cadence::smart_sleep(sleep_secs, || { mode }) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}
