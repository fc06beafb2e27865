//! Candle Builder - aggregates the tick stream into OHLC bars
//!
//! One builder per session (single symbol, single timeframe). Bar rollover
//! is tick-driven here; the forced-close timer lives in the session loop and
//! calls [`CandleBuilder::force_close`] when ticks stall.

use std::collections::VecDeque;
use tracing::warn;

use crate::types::{Bar, Tick};

/// Result of feeding one tick to the builder
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// First tick of a new bar; no prior bar was open
    Opened(Bar),
    /// Tick updated the bar in progress
    Updated,
    /// Tick crossed a boundary: previous bar closed, new bar opened
    Rolled { closed: Bar, opened: Bar },
    /// Malformed or out-of-order tick, ignored
    Dropped,
}

#[derive(Debug, Clone)]
struct BuildingBar {
    start_epoch: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl BuildingBar {
    fn new(start_epoch: i64, price: f64) -> Self {
        Self {
            start_epoch,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn update(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    fn finalize(&self, symbol: &str, timeframe_secs: i64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe_secs,
            start_epoch: self.start_epoch,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// Tick-to-bar aggregator with monotonicity guards
pub struct CandleBuilder {
    symbol: String,
    timeframe_secs: i64,
    current: Option<BuildingBar>,
    /// Epoch of the last accepted tick, for monotonicity checks
    last_epoch: i64,
    /// Start of the most recently closed bar. A closed bar is final: late
    /// ticks inside its window must not reopen it.
    last_closed_start: Option<i64>,
    /// Completed bars, oldest first
    history: VecDeque<Bar>,
    max_history: usize,
}

impl CandleBuilder {
    pub fn new(symbol: &str, timeframe_secs: i64, max_history: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe_secs,
            current: None,
            last_epoch: 0,
            last_closed_start: None,
            history: VecDeque::new(),
            max_history,
        }
    }

    /// Aligned bar start for a tick timestamp
    pub fn bar_start(&self, epoch: i64) -> i64 {
        (epoch / self.timeframe_secs) * self.timeframe_secs
    }

    /// Feed one tick. Never lets a bad tick corrupt OHLC.
    pub fn on_tick(&mut self, tick: &Tick) -> TickOutcome {
        if tick.symbol != self.symbol {
            warn!(
                expected = %self.symbol,
                got = %tick.symbol,
                "Dropping tick for unexpected symbol"
            );
            return TickOutcome::Dropped;
        }
        if !tick.price.is_finite() || tick.price <= 0.0 {
            warn!(symbol = %self.symbol, price = tick.price, "Dropping non-positive tick price");
            return TickOutcome::Dropped;
        }
        if tick.epoch < self.last_epoch {
            warn!(
                symbol = %self.symbol,
                tick_epoch = tick.epoch,
                last_epoch = self.last_epoch,
                "Dropping non-monotonic tick"
            );
            return TickOutcome::Dropped;
        }

        let start = self.bar_start(tick.epoch);
        if self.last_closed_start.map(|s| start <= s).unwrap_or(false) {
            warn!(
                symbol = %self.symbol,
                tick_epoch = tick.epoch,
                closed_bar_start = self.last_closed_start,
                "Dropping late tick inside an already-closed bar window"
            );
            return TickOutcome::Dropped;
        }

        let outcome = match self.current.as_mut() {
            None => {
                self.current = Some(BuildingBar::new(start, tick.price));
                TickOutcome::Opened(self.snapshot().expect("bar just opened"))
            }
            Some(bar) if bar.start_epoch == start => {
                bar.update(tick.price);
                TickOutcome::Updated
            }
            Some(bar) if start > bar.start_epoch => {
                let closed = bar.finalize(&self.symbol, self.timeframe_secs);
                self.push_history(closed.clone());
                self.current = Some(BuildingBar::new(start, tick.price));
                TickOutcome::Rolled {
                    closed,
                    opened: self.snapshot().expect("bar just opened"),
                }
            }
            Some(bar) => {
                // Boundary earlier than the open bar: clock went backwards
                warn!(
                    symbol = %self.symbol,
                    tick_epoch = tick.epoch,
                    bar_start = bar.start_epoch,
                    "Dropping tick before open bar boundary"
                );
                return TickOutcome::Dropped;
            }
        };

        self.last_epoch = tick.epoch;
        outcome
    }

    /// Force-close the bar in progress with whatever OHLC accumulated.
    /// The builder then awaits the next bar's first tick.
    pub fn force_close(&mut self) -> Option<Bar> {
        let bar = self.current.take()?;
        let closed = bar.finalize(&self.symbol, self.timeframe_secs);
        self.push_history(closed.clone());
        Some(closed)
    }

    /// Snapshot of the bar in progress
    pub fn snapshot(&self) -> Option<Bar> {
        self.current
            .as_ref()
            .map(|b| b.finalize(&self.symbol, self.timeframe_secs))
    }

    /// Replace the in-progress OHLC with broker-confirmed values.
    /// Close is kept from the local stream; open/high/low come from the
    /// authoritative bar.
    pub fn adopt_authoritative(&mut self, bar: &Bar) {
        if let Some(current) = self.current.as_mut() {
            if current.start_epoch == bar.start_epoch {
                current.open = bar.open;
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
            } else {
                warn!(
                    local_start = current.start_epoch,
                    broker_start = bar.start_epoch,
                    "Ignoring authoritative OHLC for a different bar"
                );
            }
        }
    }

    /// Last `n` completed bars, oldest first
    pub fn history(&self, n: usize) -> Vec<Bar> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Seed completed bars fetched from the broker REST history
    pub fn seed_history(&mut self, bars: Vec<Bar>) {
        for bar in bars {
            self.push_history(bar);
        }
    }

    fn push_history(&mut self, bar: Bar) {
        self.last_closed_start = Some(
            self.last_closed_start
                .map_or(bar.start_epoch, |s| s.max(bar.start_epoch)),
        );
        self.history.push_back(bar);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(epoch: i64, price: f64) -> Tick {
        Tick {
            symbol: "R_100".to_string(),
            epoch,
            price,
        }
    }

    #[test]
    fn test_high_low_close_track_ticks() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        // 1700000100 is aligned to a 300s boundary
        builder.on_tick(&tick(1_700_000_100, 100.0));
        builder.on_tick(&tick(1_700_000_110, 101.5));
        builder.on_tick(&tick(1_700_000_120, 99.2));
        builder.on_tick(&tick(1_700_000_130, 100.4));

        let bar = builder.snapshot().unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 101.5);
        assert_eq!(bar.low, 99.2);
        assert_eq!(bar.close, 100.4);
    }

    #[test]
    fn test_boundary_tick_rolls_bar() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        builder.on_tick(&tick(1_700_000_100, 100.0));
        let outcome = builder.on_tick(&tick(1_700_000_400, 105.0));

        match outcome {
            TickOutcome::Rolled { closed, opened } => {
                assert_eq!(closed.start_epoch, 1_699_999_800 + 300);
                assert_eq!(closed.close, 100.0);
                assert_eq!(opened.start_epoch, 1_700_000_400);
                assert_eq!(opened.open, 105.0);
            }
            other => panic!("expected Rolled, got {:?}", other),
        }
        assert_eq!(builder.history(10).len(), 1);
    }

    #[test]
    fn test_non_monotonic_tick_dropped() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        builder.on_tick(&tick(1_700_000_100, 100.0));
        builder.on_tick(&tick(1_700_000_110, 101.0));
        let outcome = builder.on_tick(&tick(1_700_000_105, 50.0));

        assert!(matches!(outcome, TickOutcome::Dropped));
        let bar = builder.snapshot().unwrap();
        assert_eq!(bar.low, 100.0, "dropped tick must not touch OHLC");
        assert_eq!(bar.close, 101.0);
    }

    #[test]
    fn test_force_close_resets_builder() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        builder.on_tick(&tick(1_700_000_100, 100.0));

        let closed = builder.force_close().unwrap();
        assert_eq!(closed.close, 100.0);
        assert!(builder.snapshot().is_none());
        // Next tick opens a fresh bar rather than closing anything
        let outcome = builder.on_tick(&tick(1_700_000_500, 101.0));
        assert!(matches!(outcome, TickOutcome::Opened(_)));
        assert_eq!(builder.history(10).len(), 1);
    }

    #[test]
    fn test_force_close_without_bar_is_noop() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        assert!(builder.force_close().is_none());
    }

    #[test]
    fn test_late_tick_cannot_reopen_force_closed_bar() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        builder.on_tick(&tick(1_700_000_100, 100.0));
        builder.force_close().unwrap();

        // A delayed tick still inside the closed bar's window must not
        // produce a second bar with the same start
        let outcome = builder.on_tick(&tick(1_700_000_200, 101.0));
        assert!(matches!(outcome, TickOutcome::Dropped));
        assert!(builder.snapshot().is_none());
        assert_eq!(builder.history(10).len(), 1);

        // The next window still opens normally
        let outcome = builder.on_tick(&tick(1_700_000_400, 101.0));
        match outcome {
            TickOutcome::Opened(bar) => assert_eq!(bar.start_epoch, 1_700_000_400),
            other => panic!("expected Opened, got {:?}", other),
        }
    }

    #[test]
    fn test_adopt_authoritative_merges_range() {
        let mut builder = CandleBuilder::new("R_100", 300, 10);
        builder.on_tick(&tick(1_700_000_100, 100.0));
        // Broker saw a wider range than the local stream (dropped ticks)
        let broker_bar = Bar {
            symbol: "R_100".to_string(),
            timeframe_secs: 300,
            start_epoch: 1_700_000_100,
            open: 99.5,
            high: 102.0,
            low: 98.0,
            close: 100.3,
        };
        builder.adopt_authoritative(&broker_bar);

        let bar = builder.snapshot().unwrap();
        assert_eq!(bar.open, 99.5);
        assert_eq!(bar.high, 102.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 100.0, "local close is the freshest value");
    }
}
