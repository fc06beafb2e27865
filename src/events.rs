//! Observability events emitted by the session.
//!
//! Consumers (log sinks, dashboards) subscribe via a broadcast channel;
//! nothing in the core logic depends on anyone listening.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::reconcile::ReconcileSummary;
use crate::types::{Bar, Direction, Prediction};

/// Session-level event for external observers
#[derive(Debug, Clone)]
pub enum BotEvent {
    BarOpened {
        bar: Bar,
    },
    BarClosed {
        bar: Bar,
        forced: bool,
    },
    PredictionMade {
        prediction: Prediction,
        trigger: f64,
    },
    Armed {
        trigger: f64,
        direction: Direction,
    },
    PositionEntered {
        position_id: uuid::Uuid,
        contract_id: String,
        entry_price: f64,
    },
    PositionClosed {
        position_id: uuid::Uuid,
        pnl: f64,
    },
    HedgeOpened {
        position_id: uuid::Uuid,
        parent_id: uuid::Uuid,
        direction: Direction,
        stake: f64,
    },
    ReconcilePass {
        summary: ReconcileSummary,
    },
    ConnectionState {
        state: &'static str,
    },
    TickStall {
        last_tick_at: DateTime<Utc>,
        elapsed_secs: u64,
    },
}

/// Cheap clonable emitter around a broadcast sender.
/// Send failures (no subscribers) are ignored.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BotEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
