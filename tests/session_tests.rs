//! End-to-end scenarios over real ledgers and a scripted broker:
//! prediction-to-entry arming, crash recovery through reconciliation, and
//! ledger persistence across process restarts.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use pulsebot::broker::{
    BrokerClient, BuyResult, ContractInfo, ContractOrder, ContractStatus, SellResult, SymbolInfo,
};
use pulsebot::candle::CandleBuilder;
use pulsebot::config::{
    AppConfig, BotConfig, ConnectionConfig, HedgeTuning, PersistenceConfig, PredictionConfig,
    ReconcileConfig, TradingConfig, WatchdogConfig,
};
use pulsebot::error::{BotError, BotResult};
use pulsebot::events::EventBus;
use pulsebot::persistence::{CsvLedger, MemoryLedger, Repository};
use pulsebot::position::{PollAction, PositionManager};
use pulsebot::prediction::Predictor;
use pulsebot::reconcile::Reconciler;
use pulsebot::session::{Session, SessionDeps, TriggerEngine};
use pulsebot::types::{Bar, Direction, Position, PositionStatus, Prediction, Tick, Timeframe};
use pulsebot::watchdog::Watchdog;

/// Scripted broker: every answer is set up front by the test
#[derive(Default)]
struct ScriptedBroker {
    balance: Mutex<f64>,
    history: Mutex<Vec<Bar>>,
    buy_responses: Mutex<Vec<BotResult<BuyResult>>>,
    contracts: Mutex<HashMap<String, ContractInfo>>,
    history_calls: AtomicUsize,
    connect_error: Mutex<Option<String>>,
}

impl ScriptedBroker {
    fn new() -> Self {
        Self {
            balance: Mutex::new(1_000.0),
            ..Default::default()
        }
    }

    fn with_history(self, bars: Vec<Bar>) -> Self {
        *self.history.lock().unwrap() = bars;
        self
    }

    fn push_buy(&self, response: BotResult<BuyResult>) {
        self.buy_responses.lock().unwrap().push(response);
    }

    fn set_contract(&self, info: ContractInfo) {
        self.contracts
            .lock()
            .unwrap()
            .insert(info.contract_id.clone(), info);
    }

    fn fail_auth(&self, reason: &str) {
        *self.connect_error.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn connect(&self) -> BotResult<()> {
        match self.connect_error.lock().unwrap().clone() {
            Some(reason) => Err(BotError::AuthRejected(reason)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> BotResult<()> {
        Ok(())
    }

    async fn subscribe_ticks(&self, _symbol: &str) -> BotResult<mpsc::Receiver<Tick>> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn get_candle_history(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        count: usize,
    ) -> BotResult<Vec<Bar>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(count);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn buy_contract(&self, _order: &ContractOrder) -> BotResult<BuyResult> {
        self.buy_responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| {
                Err(BotError::Broker {
                    operation: "buy_contract",
                    message: "no scripted response".to_string(),
                })
            })
    }

    async fn sell_contract(&self, contract_id: &str, price: f64) -> BotResult<SellResult> {
        Ok(SellResult {
            contract_id: contract_id.to_string(),
            sold_for: price,
        })
    }

    async fn get_contract_info(&self, contract_id: &str) -> BotResult<ContractInfo> {
        self.contracts
            .lock()
            .unwrap()
            .get(contract_id)
            .cloned()
            .ok_or(BotError::Broker {
                operation: "get_contract_info",
                message: format!("unknown contract {contract_id}"),
            })
    }

    async fn get_balance(&self) -> BotResult<f64> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_symbol_info(&self, symbol: &str) -> BotResult<SymbolInfo> {
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            pip_size: 0.01,
        })
    }
}

/// Predictor that always answers the same thing
struct FixedPredictor {
    direction: Direction,
    predicted_close: f64,
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(
        &self,
        _symbol: &str,
        _timeframe_label: &str,
        _history: &[Bar],
        _partial_bar: &Bar,
    ) -> BotResult<Prediction> {
        Ok(Prediction {
            direction: self.direction,
            predicted_close: self.predicted_close,
            phase: "test".to_string(),
            strategy: "fixed".to_string(),
            confidence: 0.9,
        })
    }
}

fn bar(start_epoch: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: "R_100".to_string(),
        timeframe_secs: 300,
        start_epoch,
        open,
        high,
        low,
        close,
    }
}

fn won(contract_id: &str, buy: f64, payout: f64) -> ContractInfo {
    ContractInfo {
        contract_id: contract_id.to_string(),
        status: ContractStatus::Won,
        buy_price: buy,
        sell_price: None,
        payout: Some(payout),
        bid_price: None,
        exit_tick: None,
    }
}

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("pulsebot-test-{}", uuid::Uuid::new_v4()));
        Self(dir)
    }

    fn path(&self) -> &str {
        self.0.to_str().unwrap()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn test_config(data_dir: &str) -> AppConfig {
    AppConfig {
        bot: BotConfig {
            tag: "test".to_string(),
            user_id: "u1".to_string(),
            bot_id: "b1".to_string(),
            symbol: "R_100".to_string(),
            timeframe: "5m".to_string(),
        },
        connection: ConnectionConfig {
            ws_url: "wss://127.0.0.1:1/v3".to_string(),
            heartbeat_secs: 30,
            heartbeat_grace_secs: 10,
            reconnect_base_secs: 1,
            reconnect_max_secs: 5,
            request_timeout_secs: 5,
        },
        trading: TradingConfig {
            stake: 10.0,
            wait_secs: 60,
            trigger_offset: 0.5,
            profit_take_pct: 0.8,
            repredict_delay_secs: 120,
            min_trade_secs: 60,
            entry_buffer_secs: 15,
            final_close_margin_secs: 20,
            poll_min_secs: 5,
            standby_start_hour: 0,
            standby_end_hour: 0,
            allow_equals: false,
        },
        hedge: HedgeTuning {
            reversal_threshold: 0.60,
            reversal_stake_mult: 1.5,
            reversal_detection_min: 10.0,
            pullback_min_progress: 0.25,
            pullback_max_progress: 0.60,
            pullback_stake_mult: 1.0,
            pullback_detection_start: 15.0,
            pullback_detection_end: 35.0,
            edge_reversal_min: 40.0,
            edge_extension_threshold: 0.75,
            edge_stake_mult: 1.0,
            analysis_window_min: 45.0,
        },
        reconcile: ReconcileConfig {
            interval_secs: 60,
            pending_stale_secs: 300,
        },
        watchdog: WatchdogConfig {
            check_interval_secs: 10,
            stall_threshold_secs: 60,
        },
        prediction: PredictionConfig {
            url: "http://127.0.0.1:1/predict".to_string(),
            timeout_secs: 5,
            history_bars: 50,
        },
        persistence: PersistenceConfig {
            data_dir: data_dir.to_string(),
            event_log_enabled: false,
        },
    }
}

#[tokio::test]
async fn arming_merges_authoritative_ohlc_and_sets_trigger() {
    let bar_start = 1_700_000_100;
    // Broker saw a wider range than the local stream
    let broker = Arc::new(
        ScriptedBroker::new().with_history(vec![bar(bar_start, 99.5, 102.0, 98.0, 100.3)]),
    );
    let predictor = Arc::new(FixedPredictor {
        direction: Direction::Up,
        predicted_close: 101.0,
    });
    let engine = TriggerEngine::new(broker.clone(), predictor, 0.5, 60, 15);

    let mut builder = CandleBuilder::new("R_100", 300, 10);
    builder.on_tick(&Tick {
        symbol: "R_100".to_string(),
        epoch: bar_start + 10,
        price: 100.0,
    });

    let armed = engine
        .arm(&mut builder, Timeframe::Min5, bar_start + 60)
        .await
        .unwrap()
        .expect("trigger should arm");

    assert_eq!(armed.trigger, 100.5, "up trigger is predicted close - offset");
    assert!(!armed.crossed(100.6));
    assert!(armed.crossed(100.5));

    let merged = builder.snapshot().unwrap();
    assert_eq!(merged.high, 102.0, "broker range adopted");
    assert_eq!(merged.low, 98.0);
    assert_eq!(merged.close, 100.0, "local close kept");
}

#[tokio::test(start_paused = true)]
async fn arming_skips_bar_when_authoritative_ohlc_unavailable() {
    let bar_start = 1_700_000_100;
    // History never contains the open bar
    let broker = Arc::new(ScriptedBroker::new().with_history(vec![bar(
        bar_start - 300,
        99.0,
        100.0,
        98.5,
        99.8,
    )]));
    let predictor = Arc::new(FixedPredictor {
        direction: Direction::Up,
        predicted_close: 101.0,
    });
    let engine = TriggerEngine::new(broker.clone(), predictor, 0.5, 60, 15);

    let mut builder = CandleBuilder::new("R_100", 300, 10);
    builder.on_tick(&Tick {
        symbol: "R_100".to_string(),
        epoch: bar_start + 10,
        price: 100.0,
    });

    let armed = engine
        .arm(&mut builder, Timeframe::Min5, bar_start + 60)
        .await
        .unwrap();
    assert!(armed.is_none(), "no prediction from unverified OHLC");
    assert_eq!(
        broker.history_calls.load(Ordering::SeqCst),
        2,
        "one retry before giving up"
    );
}

#[tokio::test]
async fn entry_rejection_never_retries_within_the_bar() {
    let broker = Arc::new(ScriptedBroker::new());
    broker.push_buy(Err(BotError::Broker {
        operation: "buy_contract",
        message: "market closed".to_string(),
    }));
    let repo = Arc::new(MemoryLedger::new());
    let manager = PositionManager::new(broker.clone(), repo.clone(), EventBus::default(), 0.8, 20);

    let err = manager
        .open("R_100", Direction::Up, 10.0, 240)
        .await
        .unwrap_err();
    assert!(matches!(err, BotError::Broker { .. }));
    // An explicit rejection is finalized on the spot: nothing is left for
    // reconciliation and nothing will re-attempt the entry.
    assert!(repo.unreconciled_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn crash_between_decision_and_buy_heals_via_reconciliation() {
    let tmp = TempDir::new();

    // "Process one": persists the Pending row, then dies before the buy
    {
        let ledger = CsvLedger::open(tmp.path(), true).unwrap();
        let mut position = Position::pending("R_100", Direction::Up, 10.0);
        position.opened_at = Utc::now() - ChronoDuration::seconds(600);
        ledger.insert_position(&position).await.unwrap();
    }

    // "Process two": restart, reconcile
    let ledger = Arc::new(CsvLedger::open(tmp.path(), true).unwrap());
    let broker = Arc::new(ScriptedBroker::new());
    let reconciler = Reconciler::new(broker, ledger.clone(), EventBus::default(), 300);

    let summary = reconciler.run_pass().await.unwrap();
    assert_eq!(summary.updated, 1);

    let rows = ledger.unreconciled_positions().await.unwrap();
    assert!(rows.is_empty(), "stale pending swept and frozen");
}

#[tokio::test]
async fn crash_after_buy_recovers_broker_outcome_exactly_once() {
    let tmp = TempDir::new();
    let position_id;

    // "Process one": buy confirmed, then the process dies before expiry
    {
        let ledger = CsvLedger::open(tmp.path(), true).unwrap();
        let mut position = Position::pending("R_100", Direction::Up, 10.0);
        position.status = PositionStatus::Entered;
        position.contract_id = Some("c-99".to_string());
        position_id = position.id;
        ledger.insert_position(&position).await.unwrap();
    }

    // "Process two": the broker ledger says the contract won
    let ledger = Arc::new(CsvLedger::open(tmp.path(), true).unwrap());
    let broker = Arc::new(ScriptedBroker::new());
    broker.set_contract(won("c-99", 10.0, 18.0));
    let reconciler = Reconciler::new(broker, ledger.clone(), EventBus::default(), 300);

    let first = reconciler.run_pass().await.unwrap();
    assert_eq!(first.updated, 1);

    let stored = ledger.get_position(position_id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.pnl, Some(8.0));
    assert!(stored.reconciled);

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let metrics = ledger.get_metrics(&day).await.unwrap().unwrap();
    assert_eq!(metrics.pnl, 8.0);
    assert_eq!(metrics.total_trades, 1);

    // Repeated passes must not touch the frozen row or drift the metrics
    let second = reconciler.run_pass().await.unwrap();
    assert_eq!(second.checked, 0);
    let metrics = ledger.get_metrics(&day).await.unwrap().unwrap();
    assert_eq!(metrics.pnl, 8.0);
    assert_eq!(metrics.total_trades, 1);
}

#[tokio::test]
async fn ambiguous_timeout_resolves_against_broker_ledger() {
    let tmp = TempDir::new();
    let ledger = Arc::new(CsvLedger::open(tmp.path(), true).unwrap());

    let broker = Arc::new(ScriptedBroker::new());
    broker.push_buy(Err(BotError::Timeout {
        operation: "buy_contract",
        timeout_secs: 20,
    }));
    let manager = PositionManager::new(broker.clone(), ledger.clone(), EventBus::default(), 0.8, 20);
    manager
        .open("R_100", Direction::Up, 10.0, 240)
        .await
        .unwrap_err();

    // The timed-out row stays visible to reconciliation, unlike a rejection
    let rows = ledger.unreconciled_positions().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PositionStatus::Cancelled);
    assert!(!rows[0].reconciled);

    // Fresh rows are left alone; only a stale row gets swept
    let reconciler = Reconciler::new(broker, ledger.clone(), EventBus::default(), 300);
    let summary = reconciler.run_pass().await.unwrap();
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.deferred, 1, "fresh row deferred, not swept");
}

#[tokio::test]
async fn stale_live_close_cannot_rewrite_reconciled_row() {
    let tmp = TempDir::new();
    let ledger = Arc::new(CsvLedger::open(tmp.path(), true).unwrap());

    let mut position = Position::pending("R_100", Direction::Up, 10.0);
    position.status = PositionStatus::Entered;
    position.contract_id = Some("c-7".to_string());
    ledger.insert_position(&position).await.unwrap();

    // Reconciliation resolves the contract first and freezes the row
    let broker = Arc::new(ScriptedBroker::new());
    broker.set_contract(won("c-7", 10.0, 18.0));
    let reconciler = Reconciler::new(broker.clone(), ledger.clone(), EventBus::default(), 300);
    assert_eq!(reconciler.run_pass().await.unwrap().updated, 1);

    // The broker ledger then flips: the same contract now reads Lost
    broker.set_contract(ContractInfo {
        contract_id: "c-7".to_string(),
        status: ContractStatus::Lost,
        buy_price: 10.0,
        sell_price: None,
        payout: None,
        bid_price: None,
        exit_tick: None,
    });

    // A monitor loop still holding the pre-reconciliation copy closes it
    let manager = PositionManager::new(broker, ledger.clone(), EventBus::default(), 0.8, 20);
    let action = manager.poll(&mut position, 2_000, 1_000).await.unwrap();
    assert_eq!(action, PollAction::Closed(-10.0));

    // The frozen row keeps the reconciled outcome
    let stored = ledger.get_position(position.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.pnl, Some(8.0), "reconciled pnl must not be rewritten");
    assert!(stored.reconciled);
}

#[tokio::test]
async fn auth_rejection_surfaces_as_startup_error() {
    let tmp = TempDir::new();
    let broker = Arc::new(ScriptedBroker::new());
    broker.fail_auth("invalid token");
    let events = EventBus::default();

    let err = Session::spawn(
        &test_config(tmp.path()),
        SessionDeps {
            broker,
            predictor: Arc::new(FixedPredictor {
                direction: Direction::Up,
                predicted_close: 101.0,
            }),
            repo: Arc::new(MemoryLedger::new()),
            events: events.clone(),
            watchdog: Watchdog::new(60, events),
        },
    )
    .await
    .unwrap_err();

    // The caller gets a typed error to degrade on, not a dead process
    let bot_err = err.downcast_ref::<BotError>().expect("typed error");
    assert!(matches!(bot_err, BotError::AuthRejected(_)));
    assert!(bot_err.is_fatal());
}

#[tokio::test]
async fn ledger_roundtrip_preserves_hedge_links() {
    let tmp = TempDir::new();
    let primary = Position::pending("R_100", Direction::Up, 10.0);
    let hedge = Position::pending_hedge(&primary, Direction::Down, 15.0);

    {
        let ledger = CsvLedger::open(tmp.path(), true).unwrap();
        ledger.insert_position(&primary).await.unwrap();
        ledger.insert_position(&hedge).await.unwrap();
    }

    let ledger = CsvLedger::open(tmp.path(), true).unwrap();
    let stored = ledger.get_position(hedge.id).await.unwrap().unwrap();
    assert!(stored.is_hedge);
    assert_eq!(stored.parent_id, Some(primary.id));
    assert_eq!(stored.stake, 15.0);
}
