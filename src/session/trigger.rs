//! Trigger Engine
//!
//! Turns a prediction into an armed entry trigger and detects crossing.
//! Before predicting, the in-progress bar's OHLC is re-fetched from the
//! broker: the locally-accumulated values can drift when ticks were dropped,
//! and a prediction from wrong inputs is worse than no prediction. Broker
//! values are canonical; the accepted staleness window is the single 1 s
//! retry delay plus round-trip.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::candle::CandleBuilder;
use crate::error::BotResult;
use crate::prediction::Predictor;
use crate::types::{Bar, Direction, Prediction, Timeframe};

const OHLC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// An armed trigger, valid only for the bar it was computed in
#[derive(Debug, Clone)]
pub struct ArmedTrigger {
    pub prediction: Prediction,
    pub trigger: f64,
    /// Set once the single allowed re-prediction has run
    pub repredicted: bool,
}

impl ArmedTrigger {
    /// Crossing rule: Up fires at price <= trigger, Down at price >= trigger
    pub fn crossed(&self, price: f64) -> bool {
        match self.prediction.direction {
            Direction::Up => price <= self.trigger,
            Direction::Down => price >= self.trigger,
        }
    }
}

/// Trigger = predicted close minus the offset for Up, plus it for Down;
/// offset 0 means entering exactly at the predicted close.
pub fn compute_trigger(prediction: &Prediction, offset: f64) -> f64 {
    match prediction.direction {
        Direction::Up => prediction.predicted_close - offset,
        Direction::Down => prediction.predicted_close + offset,
    }
}

/// Arming is blocked when the bar cannot fit a healthy trade anymore
pub fn can_arm(remaining_secs: i64, min_trade_secs: i64, buffer_secs: i64) -> bool {
    remaining_secs >= min_trade_secs + buffer_secs
}

pub struct TriggerEngine {
    broker: Arc<dyn BrokerClient>,
    predictor: Arc<dyn Predictor>,
    offset: f64,
    min_trade_secs: i64,
    buffer_secs: i64,
}

impl TriggerEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        predictor: Arc<dyn Predictor>,
        offset: f64,
        min_trade_secs: i64,
        buffer_secs: i64,
    ) -> Self {
        Self {
            broker,
            predictor,
            offset,
            min_trade_secs,
            buffer_secs,
        }
    }

    /// Fetch the broker's view of the bar in progress, retrying once.
    /// Returns None when the authoritative values are unavailable; the
    /// caller must then skip this bar's prediction entirely.
    async fn authoritative_partial(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bar_start: i64,
    ) -> Option<Bar> {
        for attempt in 0..2 {
            match self.broker.get_candle_history(symbol, timeframe, 1).await {
                Ok(bars) => {
                    if let Some(bar) = bars.into_iter().find(|b| b.start_epoch == bar_start) {
                        return Some(bar);
                    }
                    warn!(
                        symbol,
                        bar_start, attempt, "Broker history does not include the open bar"
                    );
                }
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "Authoritative OHLC fetch failed");
                }
            }
            if attempt == 0 {
                tokio::time::sleep(OHLC_RETRY_DELAY).await;
            }
        }
        None
    }

    /// Request a prediction and arm a trigger for the bar in progress.
    /// Ok(None) means "skip this bar": authoritative OHLC unavailable,
    /// prediction failed, or too little bar time remains.
    pub async fn arm(
        &self,
        builder: &mut CandleBuilder,
        timeframe: Timeframe,
        now_epoch: i64,
    ) -> BotResult<Option<ArmedTrigger>> {
        let Some(local) = builder.snapshot() else {
            return Ok(None);
        };

        let remaining = local.remaining_secs(now_epoch);
        if !can_arm(remaining, self.min_trade_secs, self.buffer_secs) {
            info!(
                remaining_secs = remaining,
                min_trade_secs = self.min_trade_secs,
                buffer_secs = self.buffer_secs,
                "Too little bar time remains, not arming"
            );
            return Ok(None);
        }

        let Some(authoritative) = self
            .authoritative_partial(&local.symbol, timeframe, local.start_epoch)
            .await
        else {
            warn!(
                symbol = %local.symbol,
                bar_start = local.start_epoch,
                "No authoritative OHLC, skipping prediction for this bar"
            );
            return Ok(None);
        };
        builder.adopt_authoritative(&authoritative);
        let partial = builder.snapshot().unwrap_or(local);

        let history = builder.history(usize::MAX);
        let prediction = match self
            .predictor
            .predict(&partial.symbol, timeframe.label(), &history, &partial)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Prediction failed, skipping this bar");
                return Ok(None);
            }
        };

        let trigger = compute_trigger(&prediction, self.offset);
        info!(
            direction = %prediction.direction,
            predicted_close = prediction.predicted_close,
            confidence = prediction.confidence,
            offset = self.offset,
            trigger,
            "Trigger armed"
        );
        Ok(Some(ArmedTrigger {
            prediction,
            trigger,
            repredicted: false,
        }))
    }

    /// The single allowed mid-bar re-prediction, from fresh high/low.
    /// Returns the previous trigger unchanged when anything fails.
    pub async fn repredict(
        &self,
        builder: &mut CandleBuilder,
        timeframe: Timeframe,
        previous: ArmedTrigger,
    ) -> ArmedTrigger {
        if previous.repredicted {
            return previous;
        }
        let Some(partial) = builder.snapshot() else {
            return previous;
        };

        let history = builder.history(usize::MAX);
        match self
            .predictor
            .predict(&partial.symbol, timeframe.label(), &history, &partial)
            .await
        {
            Ok(prediction) => {
                let trigger = compute_trigger(&prediction, self.offset);
                info!(
                    old_trigger = previous.trigger,
                    new_trigger = trigger,
                    direction = %prediction.direction,
                    "Re-prediction replaced trigger"
                );
                ArmedTrigger {
                    prediction,
                    trigger,
                    repredicted: true,
                }
            }
            Err(e) => {
                warn!(error = %e, "Re-prediction failed, keeping original trigger");
                ArmedTrigger {
                    repredicted: true,
                    ..previous
                }
            }
        }
    }
}
