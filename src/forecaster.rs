//! Ensemble price forecaster.
//!
//! The ML internals this component's real-world counterpart uses are out of
//! scope; this reference forecaster fits a drift-plus-noise random walk to
//! the context window and samples simulated paths forward, following the
//! `backtest_v2` subsystem's deterministic `ChaCha8Rng::seed_from_u64`
//! idiom (see `backtest_v2/hermetic.rs`) rather than an unseeded RNG, and
//! `statrs::statistics::Statistics` for mean/std-dev as in `risk.rs`.

use anyhow::Result;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand::SeedableRng;
use statrs::statistics::Statistics;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::models::{Forecast, Timeframe};
use crate::store::Store;

const MAX_CONCURRENT_SYMBOLS: usize = 5;
const HORIZON_STEPS: usize = 6;
const NUM_SAMPLES: usize = 20;
const LARGE_WINDOW: usize = 64;
const SMALL_WINDOW: usize = 16;
const MIN_CONTEXT_POINTS: usize = 10;

fn seed_for(symbol: &str, window: &[f64]) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    window.len().hash(&mut hasher);
    if let Some(last) = window.last() {
        last.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Forward-fill then back-fill missing values in place.
fn fill_gaps(values: &mut [Option<f64>]) {
    let mut last = None;
    for v in values.iter_mut() {
        if v.is_none() {
            *v = last;
        } else {
            last = *v;
        }
    }
    let mut next = None;
    for v in values.iter_mut().rev() {
        if v.is_none() {
            *v = next;
        } else {
            next = *v;
        }
    }
}

/// Drift-plus-noise random walk forecaster: fits mean/std-dev of first
/// differences over `window`, simulates `NUM_SAMPLES` paths `HORIZON_STEPS`
/// forward with a seed derived from `symbol` and `window`, and returns the
/// median of the resulting horizon-step distribution.
pub fn forecast_median(symbol: &str, window: &[f64]) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = window.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = deltas.clone().mean();
    let std_dev = if deltas.len() > 1 {
        deltas.clone().std_dev()
    } else {
        0.0
    };
    let std_dev = if std_dev.is_finite() { std_dev } else { 0.0 };

    let mut rng = ChaCha8Rng::seed_from_u64(seed_for(symbol, window));
    let start = *window.last()?;
    let mut terminal_values = Vec::with_capacity(NUM_SAMPLES);
    for _ in 0..NUM_SAMPLES {
        let mut price = start;
        for _ in 0..HORIZON_STEPS {
            let noise: f64 = rng.gen_range(-1.0..1.0) * std_dev;
            price += mean + noise;
        }
        terminal_values.push(price);
    }
    terminal_values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = terminal_values.len() / 2;
    let median = if terminal_values.len() % 2 == 0 {
        (terminal_values[mid - 1] + terminal_values[mid]) / 2.0
    } else {
        terminal_values[mid]
    };
    median.is_finite().then_some(median)
}

/// Produces and persists a forecast for one symbol, using the trailing
/// [`LARGE_WINDOW`] closes as context for the large forecaster and the
/// trailing [`SMALL_WINDOW`] for the small one.
pub async fn forecast_symbol(store: &Store, symbol: &str) -> Result<()> {
    let mut bars = store
        .recent_bars(symbol, Timeframe::FiveMinute, LARGE_WINDOW)
        .await?;
    if bars.len() < MIN_CONTEXT_POINTS {
        return Ok(());
    }
    bars.reverse(); // ascending

    let mut closes: Vec<Option<f64>> = bars.iter().map(|b| Some(b.close)).collect();
    fill_gaps(&mut closes);
    let closes: Vec<f64> = closes.into_iter().filter_map(|c| c).collect();
    if closes.len() < MIN_CONTEXT_POINTS {
        return Ok(());
    }

    let current_price = *closes.last().unwrap();
    let small_window_start = closes.len().saturating_sub(SMALL_WINDOW);
    let small_window = &closes[small_window_start..];

    let large = forecast_median(symbol, &closes);
    let small = forecast_median(symbol, small_window);
    let (large, small) = match (large, small) {
        (Some(l), Some(s)) => (l, s),
        _ => return Ok(()),
    };

    let forecast = Forecast::new(
        symbol.to_string(),
        bars.last().unwrap().timestamp,
        current_price,
        small,
        large,
    );
    store.upsert_forecast(&forecast).await?;
    Ok(())
}

/// Runs one forecast cycle across all symbols, bounded to
/// [`MAX_CONCURRENT_SYMBOLS`] concurrent tasks.
pub async fn run_cycle(store: Arc<Store>, symbols: &[String]) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SYMBOLS));
    let mut handles = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let store = store.clone();
        let semaphore = semaphore.clone();
        let symbol = symbol.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            match forecast_symbol(&store, &symbol).await {
                Ok(()) => info!(symbol = %symbol, "forecast updated"),
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "failed to forecast");
                    let _ = store
                        .log("forecaster", crate::models::LogLevel::Warning, &format!("{symbol}: {e}"))
                        .await;
                }
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "forecast task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forecast_is_deterministic_for_same_inputs() {
        let window: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
        let a = forecast_median("AAPL", &window);
        let b = forecast_median("AAPL", &window);
        assert_eq!(a, b);
    }

    #[test]
    fn forecast_differs_across_symbols_on_same_window() {
        let window: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
        let a = forecast_median("AAPL", &window);
        let b = forecast_median("MSFT", &window);
        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn forecast_none_on_too_short_window() {
        assert!(forecast_median("AAPL", &[100.0]).is_none());
    }

    #[test]
    fn fill_gaps_forward_and_back_fills() {
        let mut values = vec![None, Some(1.0), None, Some(3.0), None];
        fill_gaps(&mut values);
        assert_eq!(values, vec![Some(1.0), Some(1.0), Some(1.0), Some(3.0), Some(3.0)]);
    }

    #[test]
    fn ensemble_weights_match_contract() {
        let f = Forecast::new("AAPL".into(), chrono::Utc::now(), 100.0, 90.0, 110.0);
        let expected = 0.7 * 110.0 + 0.3 * 90.0;
        assert!((f.ensemble_predicted_price - expected).abs() < 1e-9);
    }
}
