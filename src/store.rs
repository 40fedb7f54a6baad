//! Transactional record store shared by every worker.
//!
//! Generalizes the vault subsystem's `VaultDb` connection idiom (a single
//! `rusqlite::Connection` guarded by a tokio mutex, schema bootstrapped on
//! open) to the seven tables the signal lifecycle engine reads and writes.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{
    ExecutedTrade, Forecast, Indicators, LogLevel, MarketBar, Signal, SignalStatus, SignalType,
    SleepMode, Timeframe,
};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open signal engine db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", "5000").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_bars (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, timestamp, timeframe)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_market_bars_symbol_ts
             ON market_bars(symbol, timeframe, timestamp DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS technical_indicators (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                rsi_14 REAL,
                sma_50 REAL,
                sma_200 REAL,
                lower_bb REAL,
                vwap REAL,
                atr_14 REAL,
                volume_sma_20 REAL,
                PRIMARY KEY (symbol, timestamp, timeframe)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_indicators_symbol_ts
             ON technical_indicators(symbol, timeframe, timestamp DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS forecasts (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                current_price REAL NOT NULL,
                small_predicted_price REAL NOT NULL,
                large_predicted_price REAL NOT NULL,
                ensemble_predicted_price REAL NOT NULL,
                ensemble_pct_change REAL NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_forecasts_symbol_ts
             ON forecasts(symbol, timestamp DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                signal_type TEXT NOT NULL,
                status TEXT NOT NULL,
                size REAL,
                atr REAL,
                order_id TEXT,
                UNIQUE(symbol, timestamp)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trade_signals_status ON trade_signals(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS executed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                price REAL NOT NULL,
                qty REAL NOT NULL,
                side TEXT NOT NULL,
                signal_type TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS system_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                log_level TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- market bars -------------------------------------------------

    pub async fn insert_market_bar(&self, bar: &MarketBar) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO market_bars (symbol, timestamp, timeframe, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol, timestamp, timeframe) DO NOTHING",
            params![
                bar.symbol,
                to_ts(bar.timestamp),
                bar.timeframe.as_str(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            ],
        )?;
        Ok(())
    }

    /// Most recent `limit` bars for `symbol`/`timeframe`, descending by timestamp.
    pub async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<MarketBar>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timestamp, timeframe, open, high, low, close, volume
             FROM market_bars WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, timeframe.as_str(), limit as i64], |row| {
                let tf: String = row.get(2)?;
                Ok(MarketBar {
                    symbol: row.get(0)?,
                    timestamp: from_ts(row.get(1)?),
                    timeframe: Timeframe::from_str(&tf).unwrap_or(Timeframe::FiveMinute),
                    open: row.get(3)?,
                    high: row.get(4)?,
                    low: row.get(5)?,
                    close: row.get(6)?,
                    volume: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ---- indicators ----------------------------------------------------

    pub async fn upsert_indicators(&self, ind: &Indicators) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO technical_indicators
                (symbol, timestamp, timeframe, rsi_14, sma_50, sma_200, lower_bb, vwap, atr_14, volume_sma_20)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(symbol, timestamp, timeframe) DO UPDATE SET
                rsi_14 = excluded.rsi_14,
                sma_50 = excluded.sma_50,
                sma_200 = excluded.sma_200,
                lower_bb = excluded.lower_bb,
                vwap = excluded.vwap,
                atr_14 = excluded.atr_14,
                volume_sma_20 = excluded.volume_sma_20",
            params![
                ind.symbol,
                to_ts(ind.timestamp),
                ind.timeframe.as_str(),
                ind.rsi_14,
                ind.sma_50,
                ind.sma_200,
                ind.lower_bb,
                ind.vwap,
                ind.atr_14,
                ind.volume_sma_20,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_indicators(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Indicators>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT symbol, timestamp, timeframe, rsi_14, sma_50, sma_200, lower_bb, vwap, atr_14, volume_sma_20
             FROM technical_indicators WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY timestamp DESC LIMIT 1",
            params![symbol, timeframe.as_str()],
            |row| {
                let tf: String = row.get(2)?;
                Ok(Indicators {
                    symbol: row.get(0)?,
                    timestamp: from_ts(row.get(1)?),
                    timeframe: Timeframe::from_str(&tf).unwrap_or(Timeframe::FiveMinute),
                    rsi_14: row.get(3)?,
                    sma_50: row.get(4)?,
                    sma_200: row.get(5)?,
                    lower_bb: row.get(6)?,
                    vwap: row.get(7)?,
                    atr_14: row.get(8)?,
                    volume_sma_20: row.get(9)?,
                })
            },
        )
        .optional()
        .context("load latest indicators")
    }

    // ---- forecasts -------------------------------------------------------

    pub async fn upsert_forecast(&self, f: &Forecast) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO forecasts
                (symbol, timestamp, current_price, small_predicted_price, large_predicted_price,
                 ensemble_predicted_price, ensemble_pct_change)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(symbol, timestamp) DO UPDATE SET
                current_price = excluded.current_price,
                small_predicted_price = excluded.small_predicted_price,
                large_predicted_price = excluded.large_predicted_price,
                ensemble_predicted_price = excluded.ensemble_predicted_price,
                ensemble_pct_change = excluded.ensemble_pct_change",
            params![
                f.symbol,
                to_ts(f.timestamp),
                f.current_price,
                f.small_predicted_price,
                f.large_predicted_price,
                f.ensemble_predicted_price,
                f.ensemble_pct_change,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_forecast(&self, symbol: &str) -> Result<Option<Forecast>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT symbol, timestamp, current_price, small_predicted_price, large_predicted_price,
                    ensemble_predicted_price, ensemble_pct_change
             FROM forecasts WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1",
            params![symbol],
            |row| {
                Ok(Forecast {
                    symbol: row.get(0)?,
                    timestamp: from_ts(row.get(1)?),
                    current_price: row.get(2)?,
                    small_predicted_price: row.get(3)?,
                    large_predicted_price: row.get(4)?,
                    ensemble_predicted_price: row.get(5)?,
                    ensemble_pct_change: row.get(6)?,
                })
            },
        )
        .optional()
        .context("load latest forecast")
    }

    // ---- signals -----------------------------------------------------

    /// Inserts a PENDING signal. Returns `Ok(false)` without error if a row
    /// for the same (symbol, timestamp) already exists, regardless of
    /// signal_type: at most one signal may exist per candle per symbol.
    pub async fn insert_signal_if_absent(&self, signal: &Signal) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT INTO trade_signals (symbol, timestamp, signal_type, status, size, atr, order_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(symbol, timestamp) DO NOTHING",
            params![
                signal.symbol,
                to_ts(signal.timestamp),
                signal.signal_type.as_str(),
                signal.status.as_str(),
                signal.size,
                signal.atr,
                signal.order_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn has_pending_exit(&self, symbol: &str, signal_type: SignalType) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trade_signals
             WHERE symbol = ?1 AND signal_type = ?2 AND status = 'PENDING'",
            params![symbol, signal_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn signals_with_status(&self, status: SignalStatus) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, timestamp, signal_type, status, size, atr, order_id
             FROM trade_signals WHERE status = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn update_signal(&self, signal: &Signal) -> Result<()> {
        let id = signal.id.context("signal has no id")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trade_signals SET status = ?1, size = ?2, atr = ?3, order_id = ?4 WHERE id = ?5",
            params![
                signal.status.as_str(),
                signal.size,
                signal.atr,
                signal.order_id,
                id
            ],
        )?;
        Ok(())
    }

    /// Expire every PENDING signal older than `max_age_seconds`, in one transaction.
    pub async fn expire_stale_pending(&self, now: DateTime<Utc>, max_age_seconds: i64) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let cutoff = to_ts(now) - max_age_seconds;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE trade_signals SET status = 'EXPIRED' WHERE status = 'PENDING' AND timestamp < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(n)
    }

    // ---- executed trades -----------------------------------------------

    pub async fn insert_executed_trade(&self, trade: &ExecutedTrade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO executed_trades (symbol, timestamp, price, qty, side, signal_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trade.symbol,
                to_ts(trade.timestamp),
                trade.price,
                trade.qty,
                trade.side.as_str(),
                trade.signal_type.as_str(),
            ],
        )?;
        Ok(())
    }

    // ---- system config / logs ------------------------------------------

    pub async fn sleep_mode(&self) -> Result<SleepMode> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = 'sleep_mode'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| SleepMode::from_str(&v)).unwrap_or(SleepMode::Auto))
    }

    pub async fn set_sleep_mode(&self, mode: SleepMode) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_config (key, value) VALUES ('sleep_mode', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![mode.as_str()],
        )?;
        Ok(())
    }

    pub async fn log(&self, service_name: &str, level: LogLevel, message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_logs (timestamp, service_name, log_level, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![to_ts(Utc::now()), service_name, level.as_str(), message],
        )?;
        Ok(())
    }
}

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
    let signal_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Signal {
        id: Some(row.get(0)?),
        symbol: row.get(1)?,
        timestamp: from_ts(row.get(2)?),
        signal_type: SignalType::from_str(&signal_type).unwrap_or(SignalType::TrendBuy),
        status: SignalStatus::from_str(&status).unwrap_or(SignalStatus::Failed),
        size: row.get(5)?,
        atr: row.get(6)?,
        order_id: row.get(7)?,
    })
}
