//! Tiered entry-rule and exit-rule evaluation.
//!
//! The tier structure and thresholds mirror
//! `original_source/strategy/trend_following.py`'s `run_strategy`
//! (`get_macro_regime`, the strict tier1→tier2→tier3 `elif` chain). The
//! exit rules have no counterpart there and are built fresh from the
//! specification. Candidate rows are joined in Rust rather than SQL,
//! following the store's per-table accessor idiom in `store.rs`.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::broker::{Broker, BrokerPosition};
use crate::config::Config;
use crate::models::{LogLevel, SignalType, Timeframe};
use crate::store::Store;

/// BULL unless the benchmark symbol's close sits below its SMA-50.
pub async fn macro_regime(store: &Store, benchmark_symbol: &str) -> Result<Regime> {
    let indicators = store.latest_indicators(benchmark_symbol, Timeframe::FiveMinute).await?;
    let bars = store.recent_bars(benchmark_symbol, Timeframe::FiveMinute, 1).await?;
    match (indicators.and_then(|i| i.sma_50), bars.first().map(|b| b.close)) {
        (Some(sma_50), Some(close)) if close < sma_50 => Ok(Regime::Bear),
        _ => Ok(Regime::Bull),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Bull,
    Bear,
}

struct Candidate {
    close: f64,
    volume: f64,
    sma_200: f64,
    rsi_14: f64,
    vwap: f64,
    atr_14: f64,
    volume_sma_20: f64,
    ensemble_pct_change: f64,
}

/// Loads the most recent bar/indicators/forecast for `symbol`, rejecting
/// the candidate if any required field is missing.
async fn load_candidate(store: &Store, symbol: &str) -> Result<Option<Candidate>> {
    let bars = store.recent_bars(symbol, Timeframe::FiveMinute, 1).await?;
    let Some(bar) = bars.into_iter().next() else {
        return Ok(None);
    };
    let Some(ind) = store.latest_indicators(symbol, Timeframe::FiveMinute).await? else {
        return Ok(None);
    };
    let Some(forecast) = store.latest_forecast(symbol).await? else {
        return Ok(None);
    };

    let (Some(sma_200), Some(rsi_14), Some(vwap), Some(atr_14), Some(volume_sma_20)) =
        (ind.sma_200, ind.rsi_14, ind.vwap, ind.atr_14, ind.volume_sma_20)
    else {
        return Ok(None);
    };

    Ok(Some(Candidate {
        close: bar.close,
        volume: bar.volume,
        sma_200,
        rsi_14,
        vwap,
        atr_14,
        volume_sma_20,
        ensemble_pct_change: forecast.ensemble_pct_change,
    }))
}

fn evaluate_tiers(c: &Candidate, symbol: &str, regime: Regime, kings_list: &[String]) -> Option<SignalType> {
    if c.ensemble_pct_change > 0.3 && c.volume > c.volume_sma_20 && c.close > c.vwap {
        return Some(SignalType::VwapScalp);
    }
    if kings_list.iter().any(|k| k == symbol)
        && c.close < c.sma_200
        && c.rsi_14 < 30.0
        && c.ensemble_pct_change > 0.5
    {
        return Some(SignalType::DeepValueBuy);
    }
    if regime == Regime::Bull
        && c.close > c.sma_200
        && c.rsi_14 > 35.0
        && c.rsi_14 < 55.0
        && c.ensemble_pct_change > 0.5
        && c.volume > c.volume_sma_20
    {
        return Some(SignalType::TrendBuy);
    }
    None
}

/// Evaluates entry rules for every tracked symbol and inserts PENDING
/// signals for new matches. Symbols that already have a signal for the
/// current candle, or that are missing required indicator/forecast data,
/// are skipped silently.
pub async fn evaluate_entries(store: &Store, config: &Config) -> Result<usize> {
    let regime = macro_regime(store, "SPY").await?;
    let mut inserted = 0;

    for symbol in &config.symbols {
        let Some(candidate) = load_candidate(store, symbol).await? else {
            continue;
        };
        let Some(signal_type) = evaluate_tiers(&candidate, symbol, regime, &config.kings_list) else {
            continue;
        };
        let bars = store.recent_bars(symbol, Timeframe::FiveMinute, 1).await?;
        let Some(bar) = bars.into_iter().next() else {
            continue;
        };
        let signal = crate::models::Signal::new_entry(
            symbol.clone(),
            bar.timestamp,
            signal_type,
            Some(candidate.atr_14),
        );
        if store.insert_signal_if_absent(&signal).await? {
            inserted += 1;
            info!(symbol = %symbol, signal_type = signal_type.as_str(), "entry signal emitted");
        }
    }
    Ok(inserted)
}

/// Evaluates exit rules against every open broker position.
pub async fn evaluate_exits(store: &Store, broker: &dyn Broker) -> Result<usize> {
    let positions: Vec<BrokerPosition> = match broker.list_positions().await {
        Ok(p) => p,
        Err(e) => {
            store
                .log("strategy_engine", LogLevel::Warning, &format!("list_positions failed: {e}"))
                .await?;
            return Ok(0);
        }
    };

    let mut inserted = 0;
    for position in positions {
        let Some(plpc) = position.unrealized_plpc else {
            continue;
        };
        let Some(ind) = store.latest_indicators(&position.symbol, Timeframe::FiveMinute).await? else {
            continue;
        };
        let Some(forecast) = store.latest_forecast(&position.symbol).await? else {
            continue;
        };
        let (Some(close), Some(sma_50), Some(rsi_14)) = (
            store
                .recent_bars(&position.symbol, Timeframe::FiveMinute, 1)
                .await?
                .into_iter()
                .next()
                .map(|b| b.close),
            ind.sma_50,
            ind.rsi_14,
        ) else {
            continue;
        };

        let signal_type = if plpc > 0.01 && (forecast.ensemble_pct_change < -0.4 || close < sma_50) {
            Some(SignalType::TakeProfitExit)
        } else if plpc < 0.0 && forecast.ensemble_pct_change < -0.5 && rsi_14 < 40.0 {
            Some(SignalType::PanicExit)
        } else {
            None
        };

        let Some(signal_type) = signal_type else {
            continue;
        };
        if store.has_pending_exit(&position.symbol, signal_type).await? {
            continue;
        }

        let signal = crate::models::Signal::new_exit(position.symbol.clone(), chrono::Utc::now(), signal_type);
        if store.insert_signal_if_absent(&signal).await? {
            inserted += 1;
            info!(symbol = %position.symbol, signal_type = signal_type.as_str(), "exit signal emitted");
        }
    }
    Ok(inserted)
}

pub async fn run_cycle(store: Arc<Store>, broker: Arc<dyn Broker>, config: &Config) -> Result<()> {
    evaluate_entries(&store, config).await?;
    evaluate_exits(&store, broker.as_ref()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(close: f64, volume: f64, sma_200: f64, rsi_14: f64, vwap: f64, volume_sma_20: f64, ensemble_pct_change: f64) -> Candidate {
        Candidate {
            close,
            volume,
            sma_200,
            rsi_14,
            vwap,
            atr_14: 2.0,
            volume_sma_20,
            ensemble_pct_change,
        }
    }

    #[test]
    fn vwap_scalp_wins_tier_one() {
        let c = candidate(150.0, 1_200_000.0, 140.0, 50.0, 149.5, 1_000_000.0, 0.4);
        let kings = vec!["AAPL".to_string()];
        assert_eq!(evaluate_tiers(&c, "AAPL", Regime::Bull, &kings), Some(SignalType::VwapScalp));
    }

    #[test]
    fn deep_value_buy_requires_kings_list_membership() {
        let c = candidate(100.0, 500.0, 150.0, 20.0, 110.0, 1000.0, 0.6);
        let kings = vec!["AAPL".to_string()];
        assert_eq!(evaluate_tiers(&c, "AAPL", Regime::Bull, &kings), Some(SignalType::DeepValueBuy));
        assert_eq!(evaluate_tiers(&c, "XYZ", Regime::Bull, &kings), None);
    }

    #[test]
    fn trend_buy_requires_bull_regime() {
        let c = candidate(160.0, 1_200_000.0, 150.0, 45.0, 155.0, 1_000_000.0, 0.6);
        let kings = vec![];
        assert_eq!(evaluate_tiers(&c, "XYZ", Regime::Bull, &kings), Some(SignalType::TrendBuy));
        assert_eq!(evaluate_tiers(&c, "XYZ", Regime::Bear, &kings), None);
    }

    #[test]
    fn tier_precedence_prefers_vwap_scalp_over_trend_buy() {
        // Satisfies both tier 1 and tier 3; tier 1 must win.
        let c = candidate(160.0, 1_200_000.0, 150.0, 45.0, 155.0, 1_000_000.0, 0.6);
        let kings = vec![];
        assert_eq!(evaluate_tiers(&c, "XYZ", Regime::Bull, &kings), Some(SignalType::VwapScalp));
    }

    #[test]
    fn no_tier_matches_returns_none() {
        let c = candidate(100.0, 100.0, 150.0, 50.0, 105.0, 1000.0, 0.0);
        assert_eq!(evaluate_tiers(&c, "XYZ", Regime::Bull, &[]), None);
    }
}
