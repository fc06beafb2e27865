//! Configuration management for PulseBot
//!
//! Loads from config files + environment variables via .env.
//! The core receives one strongly-typed, boundary-validated structure;
//! out-of-range hedge tuning falls back to documented defaults instead of
//! failing the session.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub connection: ConnectionConfig,
    pub trading: TradingConfig,
    pub hedge: HedgeTuning,
    pub reconcile: ReconcileConfig,
    pub watchdog: WatchdogConfig,
    pub prediction: PredictionConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging and CSV
    pub tag: String,
    /// User id this session trades for
    pub user_id: String,
    /// Bot id; one session per (user, bot) pair
    pub bot_id: String,
    /// Broker symbol to trade
    pub symbol: String,
    /// Bar timeframe (1m, 5m, 15m, 1h)
    pub timeframe: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Broker WebSocket endpoint
    pub ws_url: String,
    /// Heartbeat ping interval in seconds
    pub heartbeat_secs: u64,
    /// No pong within this grace window means the connection is dead
    pub heartbeat_grace_secs: u64,
    /// Initial reconnect delay in seconds
    pub reconnect_base_secs: u64,
    /// Reconnect delay cap in seconds
    pub reconnect_max_secs: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Stake per primary entry in account currency
    pub stake: f64,
    /// Seconds into the bar before requesting a prediction
    pub wait_secs: i64,
    /// Trigger offset from predicted close (0 = trigger at predicted close)
    pub trigger_offset: f64,
    /// Close early once unrealized profit reaches this fraction of max payout
    pub profit_take_pct: f64,
    /// Delay before the optional single re-prediction, seconds
    pub repredict_delay_secs: i64,
    /// Minimum healthy trade duration in seconds; arming is blocked when
    /// remaining bar time < min_trade_secs + entry_buffer_secs
    pub min_trade_secs: i64,
    /// Safety buffer on top of min_trade_secs
    pub entry_buffer_secs: i64,
    /// Remaining-time margin at which an in-profit position is closed
    pub final_close_margin_secs: i64,
    /// Minimum interval between contract status polls, seconds
    pub poll_min_secs: u64,
    /// Hour-of-day standby window [start, end) in UTC; equal values disable it
    pub standby_start_hour: u32,
    pub standby_end_hour: u32,
    /// Kept for parity with older deployments; never sent to the broker
    pub allow_equals: bool,
}

/// Raw hedge tuning as loaded; validated into `hedge::HedgeConfig`
#[derive(Debug, Clone, Deserialize)]
pub struct HedgeTuning {
    pub reversal_threshold: f64,
    pub reversal_stake_mult: f64,
    pub reversal_detection_min: f64,
    pub pullback_min_progress: f64,
    pub pullback_max_progress: f64,
    pub pullback_stake_mult: f64,
    pub pullback_detection_start: f64,
    pub pullback_detection_end: f64,
    pub edge_reversal_min: f64,
    pub edge_extension_threshold: f64,
    pub edge_stake_mult: f64,
    /// Overall in-position analysis window in minutes
    pub analysis_window_min: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between reconciliation passes in seconds
    pub interval_secs: u64,
    /// Pending older than this with no contract is swept to Cancelled
    pub pending_stale_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Interval between liveness checks in seconds
    pub check_interval_secs: u64,
    /// Seconds without a tick before raising a stall alert
    pub stall_threshold_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionConfig {
    /// Prediction service HTTP endpoint
    pub url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Number of closed bars sent as history
    pub history_bars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for CSV ledgers
    pub data_dir: String,
    /// Enable the append-only event log
    pub event_log_enabled: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.user_id", "local")?
            .set_default("bot.bot_id", "default")?
            .set_default("bot.symbol", "R_100")?
            .set_default("bot.timeframe", "5m")?
            // Connection defaults
            .set_default("connection.ws_url", "wss://ws.example-broker.com/v3")?
            .set_default("connection.heartbeat_secs", 30)?
            .set_default("connection.heartbeat_grace_secs", 10)?
            .set_default("connection.reconnect_base_secs", 5)?
            .set_default("connection.reconnect_max_secs", 60)?
            .set_default("connection.request_timeout_secs", 20)?
            // Trading defaults
            .set_default("trading.stake", 10.0)?
            .set_default("trading.wait_secs", 60)?
            .set_default("trading.trigger_offset", 0.5)?
            .set_default("trading.profit_take_pct", 0.80)?
            .set_default("trading.repredict_delay_secs", 120)?
            .set_default("trading.min_trade_secs", 60)?
            .set_default("trading.entry_buffer_secs", 15)?
            .set_default("trading.final_close_margin_secs", 20)?
            .set_default("trading.poll_min_secs", 5)?
            .set_default("trading.standby_start_hour", 0)?
            .set_default("trading.standby_end_hour", 0)?
            .set_default("trading.allow_equals", false)?
            // Hedge defaults (mirrors hedge::HedgeConfig::default)
            .set_default("hedge.reversal_threshold", 0.60)?
            .set_default("hedge.reversal_stake_mult", 1.5)?
            .set_default("hedge.reversal_detection_min", 10.0)?
            .set_default("hedge.pullback_min_progress", 0.25)?
            .set_default("hedge.pullback_max_progress", 0.60)?
            .set_default("hedge.pullback_stake_mult", 1.0)?
            .set_default("hedge.pullback_detection_start", 15.0)?
            .set_default("hedge.pullback_detection_end", 35.0)?
            .set_default("hedge.edge_reversal_min", 40.0)?
            .set_default("hedge.edge_extension_threshold", 0.75)?
            .set_default("hedge.edge_stake_mult", 1.0)?
            .set_default("hedge.analysis_window_min", 45.0)?
            // Reconciliation defaults
            .set_default("reconcile.interval_secs", 60)?
            .set_default("reconcile.pending_stale_secs", 300)?
            // Watchdog defaults
            .set_default("watchdog.check_interval_secs", 10)?
            .set_default("watchdog.stall_threshold_secs", 60)?
            // Prediction defaults
            .set_default("prediction.url", "http://127.0.0.1:8090/predict")?
            .set_default("prediction.timeout_secs", 10)?
            .set_default("prediction.history_bars", 50)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.event_log_enabled", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PULSEBOT_*)
            .add_source(Environment::with_prefix("PULSEBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values no default can safely absorb
    pub fn validate(&self) -> Result<()> {
        if crate::types::Timeframe::parse(&self.bot.timeframe).is_none() {
            bail!("unsupported timeframe: {}", self.bot.timeframe);
        }
        if self.trading.stake <= 0.0 {
            bail!("trading.stake must be positive, got {}", self.trading.stake);
        }
        let tf_secs = crate::types::Timeframe::parse(&self.bot.timeframe)
            .map(|t| t.duration_secs())
            .unwrap_or(0);
        if self.trading.wait_secs <= 0 || self.trading.wait_secs >= tf_secs {
            bail!(
                "trading.wait_secs must be within (0, {}), got {}",
                tf_secs,
                self.trading.wait_secs
            );
        }
        if self.trading.standby_start_hour > 23 || self.trading.standby_end_hour > 23 {
            bail!("standby hours must be within 0..=23");
        }
        Ok(())
    }

    /// Validate required environment variables
    pub fn validate_env(&self) -> Result<()> {
        if std::env::var("BROKER_API_TOKEN").is_err() {
            bail!("Required environment variable BROKER_API_TOKEN is not set");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} user={} symbol={} timeframe={} stake={:.2} wait_secs={}",
            self.bot.tag,
            self.bot.user_id,
            self.bot.symbol,
            self.bot.timeframe,
            self.trading.stake,
            self.trading.wait_secs
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
