//! Session State Machine
//!
//! Composes candle building, trigger arming, entry, hedging and position
//! monitoring into one finite-state session. All external events (ticks,
//! timer fires, broker responses) are processed one at a time on a single
//! event loop per session; timers carry a bar generation counter and verify
//! it before touching anything, so a delayed callback can detect that the
//! bar it was armed for is gone.

mod registry;
pub mod trigger;

pub use registry::{SessionKey, SessionRegistry};
pub use trigger::TriggerEngine;

use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::candle::{CandleBuilder, TickOutcome};
use crate::config::{AppConfig, TradingConfig};
use crate::error::BotError;
use crate::events::{BotEvent, EventBus};
use crate::hedge::{self, HedgeConfig, HedgeInput};
use crate::persistence::Repository;
use crate::position::{PollAction, PositionManager};
use crate::prediction::Predictor;
use crate::types::{Bar, Position, PositionStatus, Tick, Timeframe};
use crate::watchdog::Watchdog;
use trigger::ArmedTrigger;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// A bar may be open; waiting for the prediction offset to elapse
    WaitingForBar,
    AwaitingPrediction,
    Armed,
    InPosition,
    /// Fatal error: trading stopped, monitoring/reconciliation still run
    Error,
    Stopped,
}

/// Internal loop events. Timer events carry the bar generation they were
/// armed for; a mismatch means the timer is stale and must do nothing.
#[derive(Debug)]
enum LoopEvent {
    ForceClose { generation: u64 },
    PredictNow { generation: u64 },
    Repredict { generation: u64 },
    MonitorPoll { generation: u64 },
    Stop,
}

/// Control handle held by the registry
#[derive(Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<LoopEvent>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Stop the session: cancels timers, halts tick processing and closes
    /// the connection. In-flight broker operations complete and are
    /// recorded before the loop exits.
    pub async fn stop(&self) {
        let _ = self.tx.send(LoopEvent::Stop).await;
        if let Some(join) = self.join.lock().await.take() {
            let _ = join.await;
        }
    }

    /// Handle not backed by a running loop; registry tests only
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            join: Mutex::new(None),
        }
    }
}

/// Everything a session needs, bundled for construction
pub struct SessionDeps {
    pub broker: Arc<dyn BrokerClient>,
    pub predictor: Arc<dyn Predictor>,
    pub repo: Arc<dyn Repository>,
    pub events: EventBus,
    pub watchdog: Watchdog,
}

pub struct Session {
    symbol: String,
    timeframe: Timeframe,
    trading: TradingConfig,
    hedge_cfg: HedgeConfig,

    broker: Arc<dyn BrokerClient>,
    repo: Arc<dyn Repository>,
    events: EventBus,
    watchdog: Watchdog,
    trigger_engine: TriggerEngine,
    positions_mgr: PositionManager,

    builder: CandleBuilder,
    state: SessionState,
    /// Bumped whenever a new bar opens; stale timers compare against it
    generation: u64,
    armed: Option<ArmedTrigger>,
    /// Open positions for the current bar (primary + hedges)
    open_positions: Vec<Position>,
    /// At most one non-Hold hedge outcome per bar
    hedge_opened: bool,

    loop_tx: mpsc::Sender<LoopEvent>,
}

impl Session {
    /// Build and start a session: connects, subscribes and spawns the loop.
    pub async fn spawn(config: &AppConfig, deps: SessionDeps) -> anyhow::Result<Arc<SessionHandle>> {
        let timeframe = Timeframe::parse(&config.bot.timeframe)
            .ok_or_else(|| BotError::InvalidConfig(format!("timeframe {}", config.bot.timeframe)))?;

        if config.trading.allow_equals {
            // One legacy call site still sets this; the broker does not
            // accept it, so it is never forwarded on the wire.
            warn!("trading.allow_equals is set but unsupported by the broker; ignoring");
        }

        deps.broker.connect().await?;
        let tick_rx = deps.broker.subscribe_ticks(&config.bot.symbol).await?;

        let mut builder = CandleBuilder::new(
            &config.bot.symbol,
            timeframe.duration_secs(),
            config.prediction.history_bars.max(50),
        );
        match deps
            .broker
            .get_candle_history(&config.bot.symbol, timeframe, config.prediction.history_bars)
            .await
        {
            Ok(bars) => {
                // The last element may be the bar in progress; only completed
                // bars enter history so live ticks can still build it.
                let now = Utc::now().timestamp();
                builder.seed_history(bars.into_iter().filter(|b| b.end_epoch() <= now).collect());
            }
            Err(e) => warn!(error = %e, "History seed failed, starting with an empty window"),
        }

        let (loop_tx, loop_rx) = mpsc::channel(64);
        let trigger_engine = TriggerEngine::new(
            deps.broker.clone(),
            deps.predictor.clone(),
            config.trading.trigger_offset,
            config.trading.min_trade_secs,
            config.trading.entry_buffer_secs,
        );
        let positions_mgr = PositionManager::new(
            deps.broker.clone(),
            deps.repo.clone(),
            deps.events.clone(),
            config.trading.profit_take_pct,
            config.trading.final_close_margin_secs,
        );

        let session = Session {
            symbol: config.bot.symbol.clone(),
            timeframe,
            trading: config.trading.clone(),
            hedge_cfg: HedgeConfig::from_tuning(&config.hedge),
            broker: deps.broker,
            repo: deps.repo,
            events: deps.events,
            watchdog: deps.watchdog,
            trigger_engine,
            positions_mgr,
            builder,
            state: SessionState::Idle,
            generation: 0,
            armed: None,
            open_positions: Vec::new(),
            hedge_opened: false,
            loop_tx: loop_tx.clone(),
        };

        let join = tokio::spawn(session.run(loop_rx, tick_rx));
        Ok(Arc::new(SessionHandle {
            tx: loop_tx,
            join: Mutex::new(Some(join)),
        }))
    }

    async fn run(
        mut self,
        mut loop_rx: mpsc::Receiver<LoopEvent>,
        mut tick_rx: mpsc::Receiver<Tick>,
    ) {
        info!(symbol = %self.symbol, timeframe = %self.timeframe, "Session loop started");
        self.state = SessionState::WaitingForBar;

        loop {
            tokio::select! {
                // Loop events first: a bar-close event must complete before
                // the next bar's first tick is accepted.
                biased;

                event = loop_rx.recv() => match event {
                    Some(LoopEvent::Stop) | None => {
                        self.shutdown().await;
                        return;
                    }
                    Some(event) => self.handle_event(event).await,
                },
                tick = tick_rx.recv() => match tick {
                    Some(tick) => self.handle_tick(tick).await,
                    None => {
                        warn!("Tick stream ended; connection layer will replay on reconnect");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    async fn handle_tick(&mut self, tick: Tick) {
        if self.state == SessionState::Error || self.state == SessionState::Stopped {
            return;
        }
        self.watchdog.record_tick();

        // Hour-of-day standby: pause trading and the watchdog together
        let hour = Utc::now().hour();
        if in_standby(hour, self.trading.standby_start_hour, self.trading.standby_end_hour) {
            if !self.watchdog.is_paused() {
                info!(hour, "Entering standby window, trading paused");
                self.watchdog.pause();
            }
            return;
        } else if self.watchdog.is_paused() {
            info!(hour, "Leaving standby window, trading resumed");
            self.watchdog.resume();
        }

        let price = tick.price;
        let epoch = tick.epoch;
        match self.builder.on_tick(&tick) {
            TickOutcome::Dropped => return,
            TickOutcome::Opened(bar) => {
                self.on_bar_opened(bar).await;
            }
            TickOutcome::Rolled { closed, opened } => {
                self.on_bar_closed(closed, false).await;
                self.on_bar_opened(opened).await;
            }
            TickOutcome::Updated => {}
        }

        match self.state {
            SessionState::Armed => {
                let crossed = self.armed.as_ref().map(|a| a.crossed(price)).unwrap_or(false);
                if crossed {
                    self.fire_entry(price, epoch).await;
                }
            }
            SessionState::InPosition => {
                self.evaluate_hedge(price, epoch).await;
            }
            _ => {}
        }
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::ForceClose { generation } => {
                if generation != self.generation {
                    return; // stale timer, the bar already rolled
                }
                if let Some(closed) = self.builder.force_close() {
                    info!(
                        bar_start = closed.start_epoch,
                        close = closed.close,
                        "Ticks stalled, bar force-closed by timer"
                    );
                    self.on_bar_closed(closed, true).await;
                }
            }
            LoopEvent::PredictNow { generation } => {
                if generation != self.generation || self.state != SessionState::WaitingForBar {
                    return;
                }
                self.arm_trigger().await;
            }
            LoopEvent::Repredict { generation } => {
                if generation != self.generation || self.state != SessionState::Armed {
                    return;
                }
                if let Some(armed) = self.armed.take() {
                    let armed = self
                        .trigger_engine
                        .repredict(&mut self.builder, self.timeframe, armed)
                        .await;
                    self.events.emit(BotEvent::PredictionMade {
                        prediction: armed.prediction.clone(),
                        trigger: armed.trigger,
                    });
                    self.armed = Some(armed);
                }
            }
            LoopEvent::MonitorPoll { generation } => {
                if generation != self.generation || self.state != SessionState::InPosition {
                    return;
                }
                self.poll_positions().await;
            }
            LoopEvent::Stop => unreachable!("handled by the run loop"),
        }
    }

    async fn on_bar_opened(&mut self, bar: Bar) {
        self.generation += 1;
        self.armed = None;
        self.hedge_opened = false;
        self.state = SessionState::WaitingForBar;

        info!(
            bar_start = bar.start_epoch,
            open = bar.open,
            generation = self.generation,
            "Bar opened"
        );
        self.events.emit(BotEvent::BarOpened { bar: bar.clone() });

        // Forced close fires at the boundary even if every tick stalls.
        // Arming a deadline already in the past closes immediately.
        let now = Utc::now().timestamp();
        let close_in = (bar.end_epoch() - now).max(0);
        self.schedule(
            LoopEvent::ForceClose {
                generation: self.generation,
            },
            Duration::from_secs(close_in as u64),
        );

        let predict_in = (bar.start_epoch + self.trading.wait_secs - now).max(0);
        self.schedule(
            LoopEvent::PredictNow {
                generation: self.generation,
            },
            Duration::from_secs(predict_in as u64),
        );
    }

    async fn on_bar_closed(&mut self, bar: Bar, forced: bool) {
        info!(
            bar_start = bar.start_epoch,
            close = bar.close,
            forced,
            "Bar closed"
        );

        if self.state == SessionState::InPosition && !self.open_positions.is_empty() {
            let realized = self
                .positions_mgr
                .close_all(&mut self.open_positions, bar.end_epoch(), bar.end_epoch())
                .await;
            info!(realized, "Bar-end close-all complete");
        }
        self.open_positions.clear();
        self.armed = None;
        self.hedge_opened = false;
        if self.state != SessionState::Error && self.state != SessionState::Stopped {
            self.state = SessionState::WaitingForBar;
        }
        self.events.emit(BotEvent::BarClosed { bar, forced });
    }

    async fn arm_trigger(&mut self) {
        self.state = SessionState::AwaitingPrediction;
        let now = Utc::now().timestamp();
        match self
            .trigger_engine
            .arm(&mut self.builder, self.timeframe, now)
            .await
        {
            Ok(Some(armed)) => {
                self.events.emit(BotEvent::PredictionMade {
                    prediction: armed.prediction.clone(),
                    trigger: armed.trigger,
                });
                self.events.emit(BotEvent::Armed {
                    trigger: armed.trigger,
                    direction: armed.prediction.direction,
                });
                self.armed = Some(armed);
                self.state = SessionState::Armed;

                // Optional single re-prediction on longer timeframes
                if self.timeframe.supports_reprediction() {
                    let remaining = self
                        .builder
                        .snapshot()
                        .map(|b| b.remaining_secs(now))
                        .unwrap_or(0);
                    if self.trading.repredict_delay_secs < remaining {
                        self.schedule(
                            LoopEvent::Repredict {
                                generation: self.generation,
                            },
                            Duration::from_secs(self.trading.repredict_delay_secs as u64),
                        );
                    }
                }
            }
            Ok(None) => {
                self.state = SessionState::WaitingForBar;
            }
            Err(e) => {
                if e.is_fatal() {
                    self.fail(e).await;
                } else {
                    warn!(error = %e, "Arming failed, waiting for the next bar");
                    self.state = SessionState::WaitingForBar;
                }
            }
        }
    }

    async fn fire_entry(&mut self, price: f64, epoch: i64) {
        let Some(armed) = self.armed.take() else {
            return;
        };
        info!(
            price,
            trigger = armed.trigger,
            direction = %armed.prediction.direction,
            "Trigger crossed, entering"
        );

        let duration = self
            .builder
            .snapshot()
            .map(|b| b.remaining_secs(epoch))
            .unwrap_or(0)
            .max(15);

        match self
            .positions_mgr
            .open(
                &self.symbol,
                armed.prediction.direction,
                self.trading.stake,
                duration,
            )
            .await
        {
            Ok(position) => {
                self.open_positions.push(position);
                self.armed = Some(armed);
                self.state = SessionState::InPosition;
                self.schedule(
                    LoopEvent::MonitorPoll {
                        generation: self.generation,
                    },
                    Duration::from_secs(self.trading.poll_min_secs),
                );
            }
            Err(e) => {
                if e.is_fatal() {
                    self.fail(e).await;
                } else {
                    // No retry: a duplicate entry doubles exposure. Wait for
                    // the next bar.
                    warn!(error = %e, "Entry failed, returning to waiting");
                    self.state = SessionState::WaitingForBar;
                }
            }
        }
    }

    async fn evaluate_hedge(&mut self, price: f64, epoch: i64) {
        if self.hedge_opened {
            return;
        }
        let Some(armed) = self.armed.as_ref() else {
            return;
        };
        let Some(primary) = self.open_positions.iter().find(|p| !p.is_hedge).cloned() else {
            return;
        };
        if primary.status != PositionStatus::Entered {
            return;
        }
        let Some(bar) = self.builder.snapshot() else {
            return;
        };

        let input = HedgeInput {
            entry_price: primary.entry_price,
            current_price: price,
            predicted_close: armed.prediction.predicted_close,
            candle_open: bar.open,
            candle_high: bar.high,
            candle_low: bar.low,
            direction: armed.prediction.direction,
            elapsed_minutes: bar.elapsed_secs(epoch) as f64 / 60.0,
            original_stake: primary.stake,
        };
        let action = hedge::decide(&input, &self.hedge_cfg);
        let Some(direction) = action.direction(armed.prediction.direction) else {
            return;
        };
        let stake = action.stake().unwrap_or(primary.stake);

        info!(
            ?action,
            %direction,
            stake,
            price,
            elapsed_minutes = input.elapsed_minutes,
            "Hedge decision fired"
        );
        // Suppress re-evaluation for this bar regardless of the open outcome;
        // a failed hedge open must not turn into a retry loop either.
        self.hedge_opened = true;

        let duration = bar.remaining_secs(epoch).max(15);
        match self
            .positions_mgr
            .open_hedge(&primary, direction, stake, duration)
            .await
        {
            Ok(position) => self.open_positions.push(position),
            Err(e) => warn!(error = %e, "Hedge open failed, primary position unaffected"),
        }
    }

    async fn poll_positions(&mut self) {
        let now = Utc::now().timestamp();
        let bar_end = self
            .builder
            .snapshot()
            .map(|b| b.end_epoch())
            .unwrap_or(now);

        let mut any_open = false;
        let mut positions = std::mem::take(&mut self.open_positions);
        for position in positions.iter_mut() {
            if position.status != PositionStatus::Entered {
                continue;
            }
            match self.positions_mgr.poll(position, bar_end, now).await {
                Ok(PollAction::Closed(_)) => {}
                Ok(PollAction::Continue) => any_open = true,
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "Status poll failed");
                    any_open = true;
                }
            }
        }
        self.open_positions = positions;

        if any_open {
            self.schedule(
                LoopEvent::MonitorPoll {
                    generation: self.generation,
                },
                Duration::from_secs(self.trading.poll_min_secs),
            );
        } else {
            // Everything resolved before expiry; wait out the bar
            self.state = SessionState::WaitingForBar;
        }
    }

    async fn fail(&mut self, error: BotError) {
        error!(error = %error, "Fatal session error, trading stopped");
        self.state = SessionState::Error;
        let _ = self
            .repo
            .append_event("session_error", &error.to_string())
            .await;
    }

    async fn shutdown(&mut self) {
        info!(symbol = %self.symbol, "Session stopping");
        // Let in-flight closes finish and be recorded before disconnecting
        if !self.open_positions.is_empty() {
            let now = Utc::now().timestamp();
            let realized = self
                .positions_mgr
                .close_all(&mut self.open_positions, now, now)
                .await;
            info!(realized, "Shutdown close-all complete");
        }
        self.state = SessionState::Stopped;
        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "Disconnect failed during shutdown");
        }
        let _ = self.repo.append_event("session_stopped", &self.symbol).await;
    }

    /// Spawn a one-shot timer that reports back into the loop. Stale fires
    /// are filtered by generation on receipt.
    fn schedule(&self, event: LoopEvent, after: Duration) {
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event).await;
        });
    }
}

/// Hour-of-day standby window [start, end) in UTC; equal bounds disable it
fn in_standby(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standby_window() {
        // Disabled
        assert!(!in_standby(3, 0, 0));
        // Simple window [2, 5)
        assert!(!in_standby(1, 2, 5));
        assert!(in_standby(2, 2, 5));
        assert!(in_standby(4, 2, 5));
        assert!(!in_standby(5, 2, 5));
        // Wrapping window [22, 3)
        assert!(in_standby(23, 22, 3));
        assert!(in_standby(0, 22, 3));
        assert!(!in_standby(3, 22, 3));
        assert!(!in_standby(12, 22, 3));
    }
}
