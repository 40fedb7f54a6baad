//! Per-symbol technical indicator recomputation.
//!
//! The individual series (RSI via Wilder's smoothing, ATR via Wilder's
//! smoothing, a simple Bollinger band) follow `indicators/rsi.rs` and
//! `indicators/atr.rs` from the sBot9999 pack repo. The batch orchestration
//! (daily SMA-200 cache, bounded per-symbol fan-out) follows the teacher's
//! `Arc<Mutex<_>>`-guarded store access and `tokio::sync::Semaphore` usage
//! pattern for bounding concurrent work.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::models::{Indicators, MarketBar, Timeframe};
use crate::store::Store;

const MAX_CONCURRENT_SYMBOLS: usize = 5;
const BAR_WINDOW: usize = 3000;
const DAILY_WINDOW: usize = 300;

/// RSI via Wilder's smoothing. Returns one value per close starting at
/// index `period` once deltas are seeded; `None` when there isn't enough
/// history.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });
    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(v) => result.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        match rsi_from_averages(avg_gain, avg_loss) {
            Some(v) => result.push(v),
            None => break,
        }
    }
    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    rsi.is_finite().then_some(rsi)
}

/// ATR via Wilder's smoothing over OHLC bars. `None` if fewer than
/// `period + 1` bars are available.
pub fn calculate_atr(bars: &[MarketBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let mut tr: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let hl = bars[i].high - bars[i].low;
        let hc = (bars[i].high - bars[i - 1].close).abs();
        let lc = (bars[i].low - bars[i - 1].close).abs();
        tr.push(hl.max(hc).max(lc));
    }
    if tr.len() < period {
        return None;
    }
    let period_f = period as f64;
    let mut atr = tr[..period].iter().sum::<f64>() / period_f;
    if !atr.is_finite() {
        return None;
    }
    for &v in &tr[period..] {
        atr = (atr * (period_f - 1.0) + v) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }
    Some(atr)
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let v = window.iter().sum::<f64>() / period as f64;
    v.is_finite().then_some(v)
}

/// Lower Bollinger band: SMA(length) - std_dev_mult * population std dev.
pub fn lower_bollinger_band(values: &[f64], length: usize, std_dev_mult: f64) -> Option<f64> {
    if length == 0 || values.len() < length {
        return None;
    }
    let window = &values[values.len() - length..];
    let mean = window.iter().sum::<f64>() / length as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / length as f64;
    let std_dev = variance.sqrt();
    let v = mean - std_dev_mult * std_dev;
    v.is_finite().then_some(v)
}

/// Session-anchored VWAP: cumulative sum of (typical price * volume) over
/// cumulative volume, for bars sharing `bars.last()`'s UTC date.
pub fn session_vwap(bars: &[MarketBar]) -> Option<f64> {
    let last_date = bars.last()?.timestamp.date_naive();
    let mut cum_pv = 0.0;
    let mut cum_vol = 0.0;
    for bar in bars.iter().filter(|b| b.timestamp.date_naive() == last_date) {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        cum_pv += typical * bar.volume;
        cum_vol += bar.volume;
    }
    if cum_vol == 0.0 {
        None
    } else {
        Some(cum_pv / cum_vol)
    }
}

/// Forward-fill zero volume, then zero-fill anything still missing.
fn sanitize_volume(bars: &mut [MarketBar]) {
    let mut last_nonzero: Option<f64> = None;
    for bar in bars.iter_mut() {
        if bar.volume == 0.0 {
            if let Some(v) = last_nonzero {
                bar.volume = v;
            }
        } else {
            last_nonzero = Some(bar.volume);
        }
    }
}

/// In-memory cache of each symbol's daily SMA-200, keyed by (symbol, date).
/// Lives inside one indicator-engine process; never shared across workers.
#[derive(Default)]
pub struct DailySma200Cache {
    inner: SyncMutex<HashMap<(String, NaiveDate), f64>>,
}

impl DailySma200Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        self.inner.lock().get(&(symbol.to_string(), date)).copied()
    }

    fn put(&self, symbol: &str, date: NaiveDate, value: f64) {
        self.inner
            .lock()
            .insert((symbol.to_string(), date), value);
    }

    /// Resolves the daily SMA-200 for `symbol` on `date`, querying the store
    /// on a cache miss. Returns `None` (and caches nothing) if there is not
    /// enough daily history: it never falls back to a stale date's value.
    pub async fn resolve(&self, store: &Store, symbol: &str, date: NaiveDate) -> Result<Option<f64>> {
        if let Some(v) = self.get(symbol, date) {
            return Ok(Some(v));
        }
        let daily = store.recent_bars(symbol, Timeframe::OneDay, DAILY_WINDOW).await?;
        if daily.len() < 200 {
            return Ok(None);
        }
        let mut ascending = daily;
        ascending.reverse();
        let closes: Vec<f64> = ascending.iter().map(|b| b.close).collect();
        match sma(&closes, 200) {
            Some(v) => {
                self.put(symbol, date, v);
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
}

/// Recomputes and upserts the current trading day's indicators for one
/// symbol. Errors are the caller's to isolate per-symbol.
pub async fn recompute_symbol(
    store: &Store,
    cache: &DailySma200Cache,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut bars = store.recent_bars(symbol, Timeframe::FiveMinute, BAR_WINDOW).await?;
    if bars.is_empty() {
        return Ok(());
    }
    bars.reverse(); // ascending
    sanitize_volume(&mut bars);

    let max_date = bars.last().unwrap().timestamp.date_naive();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let sma_200 = cache.resolve(store, symbol, max_date).await?;
    let rsi_series = calculate_rsi(&closes, 14);

    // Walk the window, emitting one Indicators row per bar of the current
    // day, with enough trailing context at each point for the windowed
    // calculations below.
    for (i, bar) in bars.iter().enumerate() {
        if bar.timestamp.date_naive() != max_date {
            continue;
        }
        let closes_so_far = &closes[..=i];
        let volumes_so_far = &volumes[..=i];
        let bars_so_far = &bars[..=i];

        let sma_50 = sma(closes_so_far, 50);
        let rsi_14 = if i >= 14 {
            rsi_series.get(i - 14).copied()
        } else {
            None
        };
        if sma_50.is_none() || rsi_14.is_none() {
            continue;
        }

        let lower_bb = lower_bollinger_band(closes_so_far, 20, 2.0);
        let vwap = session_vwap(bars_so_far);
        let atr_14 = calculate_atr(bars_so_far, 14);
        let volume_sma_20 = sma(volumes_so_far, 20);

        let row = Indicators {
            symbol: symbol.to_string(),
            timestamp: bar.timestamp,
            timeframe: Timeframe::FiveMinute,
            rsi_14,
            sma_50,
            sma_200,
            lower_bb,
            vwap,
            atr_14,
            volume_sma_20,
        };
        store.upsert_indicators(&row).await?;
    }

    let _ = now;
    Ok(())
}

/// Recomputes indicators for every symbol, fanning work out across at most
/// `MAX_CONCURRENT_SYMBOLS` concurrent tasks. A failure on one symbol is
/// logged and does not affect the others.
pub async fn run_cycle(store: Arc<Store>, cache: Arc<DailySma200Cache>, symbols: &[String]) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SYMBOLS));
    let mut handles = Vec::with_capacity(symbols.len());
    let now = Utc::now();

    for symbol in symbols {
        let store = store.clone();
        let cache = cache.clone();
        let semaphore = semaphore.clone();
        let symbol = symbol.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            match recompute_symbol(&store, &cache, &symbol, now).await {
                Ok(()) => info!(symbol = %symbol, "indicators recomputed"),
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "failed to recompute indicators");
                    let _ = store
                        .log("indicator_engine", crate::models::LogLevel::Warning, &format!("{symbol}: {e}"))
                        .await;
                }
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "indicator task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = calculate_rsi(&closes, 14);
        assert!(!series.is_empty());
        assert!((series.last().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_insufficient_data_is_empty() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 14).is_empty());
    }

    #[test]
    fn sma_basic() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
    }

    #[test]
    fn lower_bb_on_flat_series_equals_mean() {
        let values = vec![100.0; 20];
        assert_eq!(lower_bollinger_band(&values, 20, 2.0), Some(100.0));
    }

    fn bar(ts: DateTime<Utc>, close: f64, high: f64, low: f64, volume: f64) -> MarketBar {
        MarketBar {
            symbol: "AAPL".into(),
            timestamp: ts,
            timeframe: Timeframe::FiveMinute,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn session_vwap_ignores_prior_day() {
        let day1 = Utc::now() - chrono::Duration::days(1);
        let day2 = Utc::now();
        let bars = vec![
            bar(day1, 50.0, 51.0, 49.0, 1000.0),
            bar(day2, 100.0, 101.0, 99.0, 10.0),
            bar(day2 + chrono::Duration::minutes(5), 102.0, 103.0, 101.0, 10.0),
        ];
        let vwap = session_vwap(&bars).unwrap();
        assert!(vwap > 99.0 && vwap < 103.0);
    }

    #[test]
    fn sanitize_volume_forward_fills_zeros() {
        let ts = Utc::now();
        let mut bars = vec![
            bar(ts, 1.0, 1.0, 1.0, 5.0),
            bar(ts, 1.0, 1.0, 1.0, 0.0),
            bar(ts, 1.0, 1.0, 1.0, 0.0),
        ];
        sanitize_volume(&mut bars);
        assert_eq!(bars[1].volume, 5.0);
        assert_eq!(bars[2].volume, 5.0);
    }

    #[test]
    fn sanitize_volume_zero_fills_leading_zeros() {
        let ts = Utc::now();
        let mut bars = vec![bar(ts, 1.0, 1.0, 1.0, 0.0), bar(ts, 1.0, 1.0, 1.0, 3.0)];
        sanitize_volume(&mut bars);
        assert_eq!(bars[0].volume, 0.0);
    }
}
