//! End-to-end lifecycle scenarios against an in-memory `FakeBroker` and a
//! temp-file SQLite store, in the style of the teacher's
//! `tests/backtest_run_integration.rs` (fixture-backed, self-contained).

use async_trait::async_trait;
use chrono::Utc;
use signal_engine::broker::{Broker, BrokerError, BrokerOrder, BrokerPosition, OrderRequest, OrderState};
use signal_engine::config::Config;
use signal_engine::executor::{self, CircuitBreaker};
use signal_engine::models::{OrderSide, Signal, SignalStatus, SignalType};
use signal_engine::risk;
use signal_engine::store::Store;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("scenario.db").to_str().unwrap()).unwrap();
    (dir, store)
}

fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        account_size: 100_000.0,
        risk_pct: 0.01,
        max_signal_age_minutes: 60,
        kings_list: vec!["AAPL".into()],
        symbols: vec!["AAPL".into()],
        trail_percent_default: 2.0,
        active_sleep_seconds: 300,
        passive_sleep_seconds: 3600,
        broker_key_id: None,
        broker_secret_key: None,
        broker_base_url: String::new(),
    }
}

/// A scriptable broker: submission fails `fail_submits_remaining` times
/// (optionally with a critical status), then succeeds; `get_order` always
/// reports a fill.
struct ScriptedBroker {
    submit_calls: AtomicU32,
    fail_submits_remaining: AtomicU32,
    critical: bool,
    positions: Mutex<Vec<BrokerPosition>>,
}

impl ScriptedBroker {
    fn new(fail_submits: u32, critical: bool) -> Self {
        Self {
            submit_calls: AtomicU32::new(0),
            fail_submits_remaining: AtomicU32::new(fail_submits),
            critical,
            positions: Mutex::new(vec![]),
        }
    }

    fn with_position(self, position: BrokerPosition) -> Self {
        self.positions.lock().unwrap().push(position);
        self
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn submit_order(&self, req: OrderRequest) -> Result<BrokerOrder, BrokerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_submits_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submits_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(if self.critical {
                BrokerError::Http { status: 503, body: "unavailable".into() }
            } else {
                BrokerError::Http { status: 400, body: "rejected".into() }
            });
        }
        Ok(BrokerOrder {
            id: format!("order-{}", self.submit_calls.load(Ordering::SeqCst)),
            symbol: req.symbol,
            status: OrderState::New,
            filled_qty: 0.0,
            filled_avg_price: None,
        })
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        Ok(BrokerOrder {
            id: order_id.to_string(),
            symbol: "AAPL".into(),
            status: OrderState::Filled,
            filled_qty: 6.0,
            filled_avg_price: Some(150.0),
        })
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn list_orders(&self, _symbol: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(vec![])
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError> {
        Ok(self.positions.lock().unwrap().iter().find(|p| p.symbol == symbol).cloned())
    }
}

/// A broker whose entry orders always fill but whose trailing-stop
/// submissions always fail with a non-critical rejection.
struct StopFailingBroker {
    stop_attempts: AtomicU32,
}

#[async_trait]
impl Broker for StopFailingBroker {
    async fn submit_order(&self, req: OrderRequest) -> Result<BrokerOrder, BrokerError> {
        if req.trail_price.is_some() || req.trail_percent.is_some() {
            self.stop_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(BrokerError::Http { status: 400, body: "stop rejected".into() });
        }
        Ok(BrokerOrder {
            id: "order-entry".into(),
            symbol: req.symbol,
            status: OrderState::New,
            filled_qty: 0.0,
            filled_avg_price: None,
        })
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        Ok(BrokerOrder {
            id: order_id.to_string(),
            symbol: "AAPL".into(),
            status: OrderState::Filled,
            filled_qty: 6.0,
            filled_avg_price: Some(150.0),
        })
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(vec![])
    }

    async fn list_orders(&self, _symbol: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(vec![])
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<BrokerPosition>, BrokerError> {
        Ok(None)
    }
}

// S2: Stop attach failure: the trailing stop never submits; after
// exhausting its retries the signal lands on EXECUTED_NO_STOP rather than
// staying SUBMITTED or failing the whole fill.
#[tokio::test]
async fn stop_attach_exhaustion_lands_on_executed_no_stop() {
    let (_dir, store) = temp_store();
    let config = test_config();
    let broker = StopFailingBroker { stop_attempts: AtomicU32::new(0) };
    let breaker = CircuitBreaker::new();

    let mut signal = Signal::new_entry("AAPL".into(), Utc::now(), SignalType::VwapScalp, Some(2.0));
    signal.status = SignalStatus::Sized;
    signal.size = Some(6.0);
    store.insert_signal_if_absent(&signal).await.unwrap();

    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();
    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();

    let no_stop = store.signals_with_status(SignalStatus::ExecutedNoStop).await.unwrap();
    assert_eq!(no_stop.len(), 1);
    assert_eq!(no_stop[0].symbol, "AAPL");
    assert_eq!(broker.stop_attempts.load(Ordering::SeqCst), 3);
}

// S1: Happy path: a SIZED entry signal is submitted, fills, and gets a
// trailing stop attached from its ATR, ending EXECUTED.
#[tokio::test]
async fn happy_path_entry_executes_with_trailing_stop() {
    let (_dir, store) = temp_store();
    let config = test_config();
    let broker = ScriptedBroker::new(0, false);
    let breaker = CircuitBreaker::new();

    let mut signal = Signal::new_entry("AAPL".into(), Utc::now(), SignalType::VwapScalp, Some(2.0));
    signal.status = SignalStatus::Sized;
    signal.size = Some(6.0);
    store.insert_signal_if_absent(&signal).await.unwrap();

    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();
    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();

    let executed = store.signals_with_status(SignalStatus::Executed).await.unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].symbol, "AAPL");
}

// S3: Circuit breaker: three consecutive critical submit failures trip
// the breaker and halt all further broker calls in the process.
#[tokio::test]
async fn three_critical_failures_trip_the_breaker() {
    let (_dir, store) = temp_store();
    let config = test_config();
    let broker = ScriptedBroker::new(3, true);
    let breaker = CircuitBreaker::new();

    for i in 0..3 {
        let mut signal = Signal::new_entry(format!("SYM{i}"), Utc::now(), SignalType::TrendBuy, None);
        signal.status = SignalStatus::Sized;
        signal.size = Some(1.0);
        store.insert_signal_if_absent(&signal).await.unwrap();
    }

    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();
    assert!(breaker.is_tripped());

    // Further cycles must not call the broker at all.
    let calls_before = broker.submit_calls.load(Ordering::SeqCst);
    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();
    assert_eq!(broker.submit_calls.load(Ordering::SeqCst), calls_before);
}

// S4: Staleness: a PENDING signal older than the max age is expired
// without ever being sized or sent to the broker.
#[tokio::test]
async fn stale_pending_signal_expires_without_sizing() {
    let (_dir, store) = temp_store();
    let config = test_config();

    let old_signal = Signal::new_entry(
        "AAPL".into(),
        Utc::now() - chrono::Duration::minutes(90),
        SignalType::TrendBuy,
        None,
    );
    store.insert_signal_if_absent(&old_signal).await.unwrap();

    risk::run_cycle(&store, &config).await.unwrap();

    let expired = store.signals_with_status(SignalStatus::Expired).await.unwrap();
    assert_eq!(expired.len(), 1);
    let sized = store.signals_with_status(SignalStatus::Sized).await.unwrap();
    assert!(sized.is_empty());
}

// S5: Exit path: an open position with a take-profit-eligible unrealized
// P/L is liquidated via a market sell sized to the broker-reported qty.
#[tokio::test]
async fn exit_signal_liquidates_full_broker_position() {
    let (_dir, store) = temp_store();
    let config = test_config();
    let broker = ScriptedBroker::new(0, false).with_position(BrokerPosition {
        symbol: "AAPL".into(),
        qty: 6.0,
        unrealized_plpc: Some(0.02),
    });
    let breaker = CircuitBreaker::new();

    let mut signal = Signal::new_exit("AAPL".into(), Utc::now(), SignalType::TakeProfitExit);
    signal.status = SignalStatus::Sized;
    signal.size = Some(0.0);
    store.insert_signal_if_absent(&signal).await.unwrap();

    executor::run_cycle(&store, &broker, &breaker, &config).await.unwrap();

    let executed = store.signals_with_status(SignalStatus::Executed).await.unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].size, Some(6.0));
}

// S6: Conflict rejection: two identical (symbol, timestamp) signal inserts
// leave exactly one row behind.
#[tokio::test]
async fn duplicate_signal_insert_is_suppressed() {
    let (_dir, store) = temp_store();
    let ts = Utc::now();
    let signal = Signal::new_entry("AAPL".into(), ts, SignalType::VwapScalp, Some(2.0));

    assert!(store.insert_signal_if_absent(&signal).await.unwrap());
    assert!(!store.insert_signal_if_absent(&signal).await.unwrap());

    let pending = store.signals_with_status(SignalStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
}

// S6b: the uniqueness key is (symbol, timestamp), not (symbol, timestamp,
// signal_type) — a different tier firing on the same candle must not slip
// in a second row once one tier has already claimed it.
#[tokio::test]
async fn duplicate_signal_insert_is_suppressed_across_signal_types() {
    let (_dir, store) = temp_store();
    let ts = Utc::now();
    let scalp = Signal::new_entry("AAPL".into(), ts, SignalType::VwapScalp, Some(2.0));
    let trend = Signal::new_entry("AAPL".into(), ts, SignalType::TrendBuy, Some(2.0));

    assert!(store.insert_signal_if_absent(&scalp).await.unwrap());
    assert!(!store.insert_signal_if_absent(&trend).await.unwrap());

    let pending = store.signals_with_status(SignalStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].signal_type, SignalType::VwapScalp);
}

// Side note: `OrderSide` import keeps the ExecutedTrade doc examples
// honest about the engine's canonicalized casing decision.
#[test]
fn order_side_serializes_lowercase() {
    assert_eq!(OrderSide::Buy.as_str(), "buy");
    assert_eq!(OrderSide::Sell.as_str(), "sell");
}
