//! Core types used throughout PulseBot
//!
//! Defines common data structures for ticks, bars, predictions and positions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Supported bar timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Hour1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Min5
    }
}

impl Timeframe {
    /// Get duration in seconds
    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
        }
    }

    /// Label used by the prediction service ("1m", "5m", ...)
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
        }
    }

    /// Timeframes long enough to run a second prediction mid-bar
    pub fn supports_reprediction(&self) -> bool {
        matches!(self, Timeframe::Min15 | Timeframe::Hour1)
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" => Some(Timeframe::Min1),
            "5m" | "5min" => Some(Timeframe::Min5),
            "15m" | "15min" => Some(Timeframe::Min15),
            "1h" | "1hour" => Some(Timeframe::Hour1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Trading direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }

    /// Broker contract type for this direction
    pub fn contract_type(&self) -> &'static str {
        match self {
            Direction::Up => "CALL",
            Direction::Down => "PUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// Normalized price tick from the broker stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Broker symbol (e.g. "R_100")
    pub symbol: String,
    /// Exchange timestamp in epoch seconds
    pub epoch: i64,
    /// Quote price
    pub price: f64,
}

/// OHLC bar. Mutable while open, immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Bar duration in seconds
    pub timeframe_secs: i64,
    /// Aligned start timestamp (epoch seconds)
    pub start_epoch: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    /// Epoch second at which this bar ends
    pub fn end_epoch(&self) -> i64 {
        self.start_epoch + self.timeframe_secs
    }

    /// Seconds of bar lifetime remaining at `epoch`
    pub fn remaining_secs(&self, epoch: i64) -> i64 {
        self.end_epoch() - epoch
    }

    /// Seconds elapsed since bar open at `epoch`
    pub fn elapsed_secs(&self, epoch: i64) -> i64 {
        epoch - self.start_epoch
    }
}

/// Close prediction for the bar in progress. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub direction: Direction,
    pub predicted_close: f64,
    pub phase: String,
    pub strategy: String,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Created locally, broker not yet confirmed
    Pending,
    /// Broker confirmed the contract
    Entered,
    /// Terminal with realized pnl
    Closed,
    /// Broker call failed or stale Pending swept by reconciliation
    Cancelled,
    /// Broker confirmed a contract the local record never advanced past
    OrphanExecution,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "PENDING"),
            PositionStatus::Entered => write!(f, "ENTERED"),
            PositionStatus::Closed => write!(f, "CLOSED"),
            PositionStatus::Cancelled => write!(f, "CANCELLED"),
            PositionStatus::OrphanExecution => write!(f, "ORPHAN_EXECUTION"),
        }
    }
}

impl PositionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(PositionStatus::Pending),
            "ENTERED" => Some(PositionStatus::Entered),
            "CLOSED" => Some(PositionStatus::Closed),
            "CANCELLED" => Some(PositionStatus::Cancelled),
            "ORPHAN_EXECUTION" => Some(PositionStatus::OrphanExecution),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Cancelled)
    }
}

/// A single trade (primary entry or hedge) tracked in the local ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    /// Broker-assigned contract id, None until confirmed
    pub contract_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    /// Stake in account currency
    pub stake: f64,
    /// Fill price, 0.0 until entered
    pub entry_price: f64,
    pub status: PositionStatus,
    pub is_hedge: bool,
    /// Primary position this hedge offsets
    pub parent_id: Option<Uuid>,
    /// Once true, pnl/status are frozen forever
    pub reconciled: bool,
    pub pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// New local Pending position, created before the broker is contacted
    pub fn pending(symbol: &str, direction: Direction, stake: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id: None,
            symbol: symbol.to_string(),
            direction,
            stake,
            entry_price: 0.0,
            status: PositionStatus::Pending,
            is_hedge: false,
            parent_id: None,
            reconciled: false,
            pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// New local Pending hedge tied to a primary position
    pub fn pending_hedge(parent: &Position, direction: Direction, stake: f64) -> Self {
        Self {
            is_hedge: true,
            parent_id: Some(parent.id),
            ..Self::pending(&parent.symbol, direction, stake)
        }
    }
}

/// Aggregated performance for one calendar period.
/// Always fully recomputed from Closed+reconciled positions, never incremented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodMetrics {
    /// Period key: "YYYY-MM-DD" for daily, "YYYY-MM" for monthly
    pub period: String,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in [
            Timeframe::Min1,
            Timeframe::Min5,
            Timeframe::Min15,
            Timeframe::Hour1,
        ] {
            assert_eq!(Timeframe::parse(tf.label()), Some(tf));
        }
        assert_eq!(Timeframe::parse("3m"), None);
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Up.opposite(), Direction::Down);
        assert_eq!(Direction::Down.opposite(), Direction::Up);
    }

    #[test]
    fn test_pending_hedge_links_parent() {
        let primary = Position::pending("R_100", Direction::Up, 10.0);
        let hedge = Position::pending_hedge(&primary, Direction::Down, 5.0);
        assert!(hedge.is_hedge);
        assert_eq!(hedge.parent_id, Some(primary.id));
        assert_eq!(hedge.symbol, primary.symbol);
        assert_eq!(hedge.status, PositionStatus::Pending);
    }
}
