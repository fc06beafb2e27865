//! Hedge Decision Engine
//!
//! Pure classification of an in-position situation into Hold / Reinforce /
//! Hedge / Edge-Reversal with sizing. Rules are evaluated in priority order,
//! first match wins, each gated by its own minute window inside the overall
//! analysis window. The session enforces "at most one non-Hold per bar".

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::HedgeTuning;
use crate::types::Direction;

/// Everything the decision needs, captured at evaluation time
#[derive(Debug, Clone)]
pub struct HedgeInput {
    pub entry_price: f64,
    pub current_price: f64,
    pub predicted_close: f64,
    /// Open of the bar the position trades in
    pub candle_open: f64,
    pub candle_high: f64,
    pub candle_low: f64,
    /// Predicted direction of the primary position
    pub direction: Direction,
    pub elapsed_minutes: f64,
    pub original_stake: f64,
}

/// Outcome of one evaluation. Reinforce keeps the primary direction;
/// Hedge and EdgeReversal open against it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HedgeAction {
    Hold,
    Reinforce { stake: f64 },
    Hedge { stake: f64 },
    EdgeReversal { stake: f64 },
}

impl HedgeAction {
    /// Direction the resulting position should take, if any
    pub fn direction(&self, primary: Direction) -> Option<Direction> {
        match self {
            HedgeAction::Hold => None,
            HedgeAction::Reinforce { .. } => Some(primary),
            HedgeAction::Hedge { .. } | HedgeAction::EdgeReversal { .. } => {
                Some(primary.opposite())
            }
        }
    }

    pub fn stake(&self) -> Option<f64> {
        match self {
            HedgeAction::Hold => None,
            HedgeAction::Reinforce { stake }
            | HedgeAction::Hedge { stake }
            | HedgeAction::EdgeReversal { stake } => Some(*stake),
        }
    }
}

/// Range-validated hedge tuning. Invalid fields fall back to these defaults
/// individually rather than failing the session.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeConfig {
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
    pub analysis_window_min: f64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
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
        }
    }
}

fn checked(name: &str, value: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= lo && value <= hi {
        value
    } else {
        warn!(
            field = name,
            value,
            min = lo,
            max = hi,
            fallback,
            "Hedge tuning out of range, using default"
        );
        fallback
    }
}

impl HedgeConfig {
    /// Validate externally-supplied tuning field by field
    pub fn from_tuning(t: &HedgeTuning) -> Self {
        let d = Self::default();
        let mut cfg = Self {
            reversal_threshold: checked(
                "reversal_threshold",
                t.reversal_threshold,
                0.0,
                1.0,
                d.reversal_threshold,
            ),
            reversal_stake_mult: checked(
                "reversal_stake_mult",
                t.reversal_stake_mult,
                0.1,
                10.0,
                d.reversal_stake_mult,
            ),
            reversal_detection_min: checked(
                "reversal_detection_min",
                t.reversal_detection_min,
                0.0,
                120.0,
                d.reversal_detection_min,
            ),
            pullback_min_progress: checked(
                "pullback_min_progress",
                t.pullback_min_progress,
                0.0,
                1.0,
                d.pullback_min_progress,
            ),
            pullback_max_progress: checked(
                "pullback_max_progress",
                t.pullback_max_progress,
                0.0,
                1.0,
                d.pullback_max_progress,
            ),
            pullback_stake_mult: checked(
                "pullback_stake_mult",
                t.pullback_stake_mult,
                0.1,
                10.0,
                d.pullback_stake_mult,
            ),
            pullback_detection_start: checked(
                "pullback_detection_start",
                t.pullback_detection_start,
                0.0,
                120.0,
                d.pullback_detection_start,
            ),
            pullback_detection_end: checked(
                "pullback_detection_end",
                t.pullback_detection_end,
                0.0,
                120.0,
                d.pullback_detection_end,
            ),
            edge_reversal_min: checked(
                "edge_reversal_min",
                t.edge_reversal_min,
                0.0,
                120.0,
                d.edge_reversal_min,
            ),
            edge_extension_threshold: checked(
                "edge_extension_threshold",
                t.edge_extension_threshold,
                0.0,
                1.0,
                d.edge_extension_threshold,
            ),
            edge_stake_mult: checked(
                "edge_stake_mult",
                t.edge_stake_mult,
                0.1,
                10.0,
                d.edge_stake_mult,
            ),
            analysis_window_min: checked(
                "analysis_window_min",
                t.analysis_window_min,
                1.0,
                240.0,
                d.analysis_window_min,
            ),
        };
        // Window ordering must stay coherent after per-field fallback
        if cfg.pullback_min_progress > cfg.pullback_max_progress {
            warn!(
                min = cfg.pullback_min_progress,
                max = cfg.pullback_max_progress,
                "Pullback progress bounds inverted, using defaults"
            );
            cfg.pullback_min_progress = d.pullback_min_progress;
            cfg.pullback_max_progress = d.pullback_max_progress;
        }
        if cfg.pullback_detection_start > cfg.pullback_detection_end {
            warn!(
                start = cfg.pullback_detection_start,
                end = cfg.pullback_detection_end,
                "Pullback window inverted, using defaults"
            );
            cfg.pullback_detection_start = d.pullback_detection_start;
            cfg.pullback_detection_end = d.pullback_detection_end;
        }
        cfg
    }
}

/// Pure decision function: identical inputs always yield identical outputs.
pub fn decide(input: &HedgeInput, cfg: &HedgeConfig) -> HedgeAction {
    let elapsed = input.elapsed_minutes;
    if elapsed < 0.0 || elapsed > cfg.analysis_window_min {
        return HedgeAction::Hold;
    }

    let range = input.candle_high - input.candle_low;
    if range <= f64::EPSILON {
        return HedgeAction::Hold;
    }

    let body = input.current_price - input.candle_open;
    let body_matches_prediction = match input.direction {
        Direction::Up => body > 0.0,
        Direction::Down => body < 0.0,
    };

    // 1. Reversal hedge: the bar has realized most of its range against us
    if elapsed >= cfg.reversal_detection_min && elapsed <= cfg.pullback_detection_end {
        let opposite_extension = match input.direction {
            Direction::Up => (input.candle_open - input.candle_low) / range,
            Direction::Down => (input.candle_high - input.candle_open) / range,
        };
        if opposite_extension >= cfg.reversal_threshold {
            return HedgeAction::Hedge {
                stake: input.original_stake * cfg.reversal_stake_mult,
            };
        }
    }

    // 2. Pullback reinforcement: partial progress toward the predicted close
    if elapsed >= cfg.pullback_detection_start && elapsed <= cfg.pullback_detection_end {
        let expected = (input.predicted_close - input.candle_open).abs();
        if expected > f64::EPSILON && body_matches_prediction {
            let actual = match input.direction {
                Direction::Up => input.current_price - input.candle_open,
                Direction::Down => input.candle_open - input.current_price,
            };
            let progress = actual / expected;
            if progress >= cfg.pullback_min_progress && progress <= cfg.pullback_max_progress {
                return HedgeAction::Reinforce {
                    stake: input.original_stake * cfg.pullback_stake_mult,
                };
            }
        }
    }

    // 3. Edge reversal: late in the bar and over-extended in our direction
    if elapsed >= cfg.edge_reversal_min && body_matches_prediction {
        let extension = body.abs() / range;
        if extension >= cfg.edge_extension_threshold {
            return HedgeAction::EdgeReversal {
                stake: input.original_stake * cfg.edge_stake_mult,
            };
        }
    }

    HedgeAction::Hold
}
