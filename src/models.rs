use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Candle width a [`MarketBar`] or [`Indicators`] row was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::OneDay => "1d",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinute),
            "1d" => Ok(Timeframe::OneDay),
            other => Err(anyhow::anyhow!("unknown timeframe: {other}")),
        }
    }
}

/// One OHLCV candle, immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Technical indicators for one (symbol, timestamp, timeframe) row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicators {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub rsi_14: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub lower_bb: Option<f64>,
    pub vwap: Option<f64>,
    pub atr_14: Option<f64>,
    pub volume_sma_20: Option<f64>,
}

/// An ensemble forecast produced for one symbol at one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub current_price: f64,
    pub small_predicted_price: f64,
    pub large_predicted_price: f64,
    pub ensemble_predicted_price: f64,
    pub ensemble_pct_change: f64,
}

impl Forecast {
    pub fn new(
        symbol: String,
        timestamp: DateTime<Utc>,
        current_price: f64,
        small_predicted_price: f64,
        large_predicted_price: f64,
    ) -> Self {
        let ensemble_predicted_price = 0.7 * large_predicted_price + 0.3 * small_predicted_price;
        let ensemble_pct_change = if current_price == 0.0 {
            0.0
        } else {
            (ensemble_predicted_price - current_price) / current_price * 100.0
        };
        Self {
            symbol,
            timestamp,
            current_price,
            small_predicted_price,
            large_predicted_price,
            ensemble_predicted_price,
            ensemble_pct_change,
        }
    }
}

/// Entry/exit signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    VwapScalp,
    DeepValueBuy,
    TrendBuy,
    TakeProfitExit,
    PanicExit,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::VwapScalp => "VWAP_SCALP",
            SignalType::DeepValueBuy => "DEEP_VALUE_BUY",
            SignalType::TrendBuy => "TREND_BUY",
            SignalType::TakeProfitExit => "TAKE_PROFIT_EXIT",
            SignalType::PanicExit => "PANIC_EXIT",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "VWAP_SCALP" => Ok(SignalType::VwapScalp),
            "DEEP_VALUE_BUY" => Ok(SignalType::DeepValueBuy),
            "TREND_BUY" => Ok(SignalType::TrendBuy),
            "TAKE_PROFIT_EXIT" => Ok(SignalType::TakeProfitExit),
            "PANIC_EXIT" => Ok(SignalType::PanicExit),
            other => Err(anyhow::anyhow!("unknown signal type: {other}")),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, SignalType::TakeProfitExit | SignalType::PanicExit)
    }

    /// ATR multiplier used to size a protective trailing stop for this entry type.
    pub fn trail_atr_multiplier(&self) -> Option<f64> {
        match self {
            SignalType::VwapScalp => Some(1.5),
            SignalType::DeepValueBuy => Some(2.0),
            SignalType::TrendBuy => Some(3.0),
            SignalType::TakeProfitExit | SignalType::PanicExit => None,
        }
    }
}

/// Lifecycle state of a [`Signal`]. Transitions are one-directional; see the
/// state diagram in the design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pending,
    Sized,
    Submitted,
    Executed,
    ExecutedNoStop,
    Failed,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "PENDING",
            SignalStatus::Sized => "SIZED",
            SignalStatus::Submitted => "SUBMITTED",
            SignalStatus::Executed => "EXECUTED",
            SignalStatus::ExecutedNoStop => "EXECUTED_NO_STOP",
            SignalStatus::Failed => "FAILED",
            SignalStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "PENDING" => Ok(SignalStatus::Pending),
            "SIZED" => Ok(SignalStatus::Sized),
            "SUBMITTED" => Ok(SignalStatus::Submitted),
            "EXECUTED" => Ok(SignalStatus::Executed),
            "EXECUTED_NO_STOP" => Ok(SignalStatus::ExecutedNoStop),
            "FAILED" => Ok(SignalStatus::Failed),
            "EXPIRED" => Ok(SignalStatus::Expired),
            other => Err(anyhow::anyhow!("unknown signal status: {other}")),
        }
    }
}

/// A row in the central signal lifecycle table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub signal_type: SignalType,
    pub status: SignalStatus,
    pub size: Option<f64>,
    pub atr: Option<f64>,
    pub order_id: Option<String>,
}

impl Signal {
    pub fn new_entry(symbol: String, timestamp: DateTime<Utc>, signal_type: SignalType, atr: Option<f64>) -> Self {
        Self {
            id: None,
            symbol,
            timestamp,
            signal_type,
            status: SignalStatus::Pending,
            size: None,
            atr,
            order_id: None,
        }
    }

    pub fn new_exit(symbol: String, timestamp: DateTime<Utc>, signal_type: SignalType) -> Self {
        Self {
            id: None,
            symbol,
            timestamp,
            signal_type,
            status: SignalStatus::Pending,
            size: None,
            atr: None,
            order_id: None,
        }
    }
}

/// Side of an executed fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// An append-only record of a completed fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub id: Option<i64>,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub qty: f64,
    pub side: OrderSide,
    pub signal_type: SignalType,
}

/// System-wide override of the cadence controller's sleep behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SleepMode {
    Auto,
    ForceAwake,
    ForceSleep,
}

impl SleepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepMode::Auto => "AUTO",
            SleepMode::ForceAwake => "FORCE_AWAKE",
            SleepMode::ForceSleep => "FORCE_SLEEP",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "FORCE_AWAKE" => SleepMode::ForceAwake,
            "FORCE_SLEEP" => SleepMode::ForceSleep,
            _ => SleepMode::Auto,
        }
    }
}

/// Severity recorded alongside a [`SystemLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// An append-only audit trail entry, mirrored to `tracing` at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLog {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub log_level: LogLevel,
    pub message: String,
}
