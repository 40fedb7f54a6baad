//! Typed process configuration, read once per worker cycle from the
//! environment. Mirrors `Config::from_env` from the teacher crate's
//! original `models.rs`: `dotenv` + `std::env::var` with parse-or-default
//! chains, generalized to the keys every worker in this engine recognizes.

use crate::models::SleepMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub account_size: f64,
    pub risk_pct: f64,
    pub max_signal_age_minutes: i64,
    pub kings_list: Vec<String>,
    pub symbols: Vec<String>,
    pub trail_percent_default: f64,
    pub active_sleep_seconds: i64,
    pub passive_sleep_seconds: i64,
    pub broker_key_id: Option<String>,
    pub broker_secret_key: Option<String>,
    pub broker_base_url: String,
}

fn default_symbols() -> Vec<String> {
    [
        "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META", "JPM", "V", "UNH",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_kings_list() -> Vec<String> {
    ["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn parse_symbol_list(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./signal_engine.db".to_string());

        let account_size = std::env::var("ACCOUNT_SIZE")
            .unwrap_or_else(|_| "100000".to_string())
            .parse()
            .unwrap_or(100_000.0);

        let risk_pct = std::env::var("RISK_PCT")
            .unwrap_or_else(|_| "0.01".to_string())
            .parse()
            .unwrap_or(0.01);

        let max_signal_age_minutes = std::env::var("MAX_SIGNAL_AGE_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let kings_list = match std::env::var("KINGS_LIST") {
            Ok(raw) => parse_symbol_list(raw),
            Err(_) => default_kings_list(),
        };

        let symbols = match std::env::var("SYMBOLS") {
            Ok(raw) => parse_symbol_list(raw),
            Err(_) => default_symbols(),
        };

        let trail_percent_default = std::env::var("TRAIL_PERCENT_DEFAULT")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse()
            .unwrap_or(2.0);

        let active_sleep_seconds = std::env::var("ACTIVE_SLEEP_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let passive_sleep_seconds = std::env::var("PASSIVE_SLEEP_SECONDS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let broker_key_id = std::env::var("BROKER_KEY_ID").ok();
        let broker_secret_key = std::env::var("BROKER_SECRET_KEY").ok();
        let broker_base_url = std::env::var("BROKER_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.example-broker.com".to_string());

        Ok(Self {
            database_path,
            account_size,
            risk_pct,
            max_signal_age_minutes,
            kings_list,
            symbols,
            trail_percent_default,
            active_sleep_seconds,
            passive_sleep_seconds,
            broker_key_id,
            broker_secret_key,
            broker_base_url,
        })
    }

    /// Tracked symbols plus the always-implicit macro-regime benchmark.
    pub fn symbols_with_benchmark(&self) -> Vec<String> {
        let mut out = self.symbols.clone();
        if !out.iter().any(|s| s == "SPY") {
            out.push("SPY".to_string());
        }
        out
    }
}

/// Reads the `sleep_mode` override out of the store, falling back to AUTO.
/// Kept separate from [`Config`] because it is mutated at runtime by the
/// dashboard collaborator, unlike everything else in this struct.
pub async fn current_sleep_mode(store: &crate::store::Store) -> SleepMode {
    store.sleep_mode().await.unwrap_or(SleepMode::Auto)
}
