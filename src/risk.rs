//! Position sizing and signal staleness expiry.
//!
//! The sizing rule follows `original_source/execution/risk_manager.py`'s
//! `calculate_position_size` (`floor(account_size * risk_pct / close)`),
//! generalized with the specification's definitive "most recent close via
//! subquery" rule (the Python reference instead joined on an exact
//! timestamp match, which silently drops a signal whenever its own candle
//! is missing: not reproduced here) and with the staleness/EXPIRED path
//! the Python reference lacks entirely.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{SignalStatus, SignalType, Timeframe};
use crate::store::Store;

/// shares = floor(account_size * risk_pct / close); `None` if no usable
/// price is available or the computed size would be zero.
pub fn calculate_position_size(account_size: f64, risk_pct: f64, close: f64) -> Option<f64> {
    if close <= 0.0 {
        return None;
    }
    let position_value = account_size * risk_pct;
    let shares = (position_value / close).floor();
    if shares > 0.0 {
        Some(shares)
    } else {
        None
    }
}

/// Sizes every PENDING signal against its symbol's most recent 5m close.
/// Exit signals are sized to 0 (the executor interprets this as "liquidate
/// the full position") without a price lookup. Signals that cannot be
/// priced are left PENDING for a future cycle to retry, or for staleness
/// expiry to eventually retire.
pub async fn size_pending_signals(store: &Store, config: &Config) -> Result<usize> {
    let pending = store.signals_with_status(SignalStatus::Pending).await?;
    let mut sized = 0;

    for mut signal in pending {
        if signal.signal_type.is_exit() {
            signal.size = Some(0.0);
            signal.status = SignalStatus::Sized;
            store.update_signal(&signal).await?;
            sized += 1;
            continue;
        }

        let recent = store
            .recent_bars(&signal.symbol, Timeframe::FiveMinute, 1)
            .await?;
        let Some(close) = recent.first().map(|b| b.close) else {
            continue;
        };

        match calculate_position_size(config.account_size, config.risk_pct, close) {
            Some(shares) => {
                signal.size = Some(shares);
                signal.status = SignalStatus::Sized;
                store.update_signal(&signal).await?;
                sized += 1;
                info!(symbol = %signal.symbol, shares, "signal sized");
            }
            None => {
                warn!(symbol = %signal.symbol, close, "computed size is zero, leaving PENDING");
            }
        }
    }
    Ok(sized)
}

/// Expires PENDING signals older than `config.max_signal_age_minutes`.
pub async fn expire_stale_signals(store: &Store, config: &Config) -> Result<usize> {
    let max_age_seconds = config.max_signal_age_minutes * 60;
    let n = store.expire_stale_pending(Utc::now(), max_age_seconds).await?;
    if n > 0 {
        info!(count = n, "expired stale pending signals");
    }
    Ok(n)
}

pub async fn run_cycle(store: &Store, config: &Config) -> Result<()> {
    expire_stale_signals(store, config).await?;
    size_pending_signals(store, config).await?;
    Ok(())
}

/// ATR-derived trailing-stop parameter for a filled entry, per signal type.
/// Falls back to the configured flat percent when the ATR is unknown or the
/// signal type has no multiplier (exits never reach this path).
pub fn trail_stop_params(signal_type: SignalType, atr: Option<f64>, fallback_pct: f64) -> (Option<f64>, Option<f64>) {
    match (signal_type.trail_atr_multiplier(), atr) {
        (Some(mult), Some(atr)) if atr > 0.0 => (Some((mult * atr * 100.0).round() / 100.0), None),
        _ => (None, Some(fallback_pct)),
    }
}
