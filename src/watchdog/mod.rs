//! Liveness Watchdog
//!
//! Detects stalled tick processing. Pausable for intentional standby (the
//! hour-of-day filter); resuming resets the activity clock so a pause never
//! turns into an instant false alarm.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use crate::events::{BotEvent, EventBus};

struct Inner {
    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    paused: AtomicBool,
}

/// Tick-liveness monitor shared between the session loop and the check task
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
    threshold: Duration,
    events: EventBus,
}

impl Watchdog {
    pub fn new(stall_threshold_secs: u64, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                last_activity: Mutex::new((Instant::now(), Utc::now())),
                paused: AtomicBool::new(false),
            }),
            threshold: Duration::from_secs(stall_threshold_secs),
            events,
        }
    }

    /// Record a successfully processed tick
    pub fn record_tick(&self) {
        let mut last = self.inner.last_activity.lock().expect("watchdog lock");
        *last = (Instant::now(), Utc::now());
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Watchdog paused for standby");
    }

    /// Resume monitoring; resets the activity clock
    pub fn resume(&self) {
        self.record_tick();
        self.inner.paused.store(false, Ordering::SeqCst);
        info!("Watchdog resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// One liveness check. Returns true when a stall alert was raised.
    pub fn check(&self) -> bool {
        if self.is_paused() {
            return false;
        }
        let (instant, wall) = *self.inner.last_activity.lock().expect("watchdog lock");
        let elapsed = instant.elapsed();
        if elapsed <= self.threshold {
            return false;
        }
        warn!(
            elapsed_secs = elapsed.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            last_tick_at = %wall,
            "Tick processing stalled"
        );
        self.events.emit(BotEvent::TickStall {
            last_tick_at: wall,
            elapsed_secs: elapsed.as_secs(),
        });
        true
    }

    /// Spawn the fixed-interval check task
    pub fn spawn(&self, check_interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(check_interval_secs.max(1)));
            loop {
                ticker.tick().await;
                watchdog.check();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stall_detected_after_threshold() {
        let watchdog = Watchdog::new(5, EventBus::default());
        watchdog.record_tick();
        assert!(!watchdog.check());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(watchdog.check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_watchdog_never_alerts() {
        let watchdog = Watchdog::new(5, EventBus::default());
        watchdog.pause();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!watchdog.check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_resets_activity_clock() {
        let watchdog = Watchdog::new(5, EventBus::default());
        watchdog.pause();
        tokio::time::advance(Duration::from_secs(60)).await;
        watchdog.resume();
        // No immediate false alarm after the standby window
        assert!(!watchdog.check());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(watchdog.check());
    }
}
