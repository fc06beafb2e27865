//! PulseBot entrypoint
//!
//! Wires the broker connection, prediction client, CSV ledger and session
//! loop together, then runs until Ctrl-C. Reconciliation runs on its own
//! interval task so crash leftovers heal even while trading is idle.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pulsebot::broker::ConnectionManager;
use pulsebot::config::AppConfig;
use pulsebot::events::{BotEvent, EventBus};
use pulsebot::persistence::{CsvLedger, Repository};
use pulsebot::prediction::PredictionClient;
use pulsebot::reconcile::Reconciler;
use pulsebot::session::{Session, SessionDeps, SessionKey, SessionRegistry};
use pulsebot::watchdog::Watchdog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::load()?;
    config.validate_env()?;
    info!(config = %config.digest(), "PulseBot starting");

    let token = std::env::var("BROKER_API_TOKEN")?;

    let events = EventBus::default();
    let broker = Arc::new(ConnectionManager::new(
        config.connection.clone(),
        token,
        events.clone(),
    ));
    let predictor = Arc::new(PredictionClient::new(&config.prediction)?);
    let repo = Arc::new(CsvLedger::open(
        &config.persistence.data_dir,
        config.persistence.event_log_enabled,
    )?);

    let watchdog = Watchdog::new(config.watchdog.stall_threshold_secs, events.clone());
    let watchdog_task = watchdog.spawn(config.watchdog.check_interval_secs);

    // Sweep crash leftovers before the first trade, then keep sweeping
    let reconciler = Arc::new(Reconciler::new(
        broker.clone(),
        repo.clone(),
        events.clone(),
        config.reconcile.pending_stale_secs,
    ));
    let reconcile_task = {
        let reconciler = reconciler.clone();
        let interval_secs = config.reconcile.interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                match reconciler.run_pass().await {
                    Ok(summary) if summary.updated > 0 => {
                        info!(?summary, "Reconciliation pass updated rows");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                }
            }
        })
    };

    // Event sink: stall alerts to the log, everything to the event ledger
    let mut event_rx = events.subscribe();
    let event_repo = repo.clone();
    let log_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let BotEvent::TickStall {
                last_tick_at,
                elapsed_secs,
            } = &event
            {
                error!(last_tick_at = %last_tick_at, elapsed_secs, "ALERT: tick stream stalled");
            }
            let (kind, detail) = describe_event(&event);
            if let Err(e) = event_repo.append_event(kind, &detail).await {
                warn!(error = %e, "Event log append failed");
            }
        }
    });

    let registry = SessionRegistry::new();
    let key = SessionKey::new(&config.bot.user_id, &config.bot.bot_id);
    match Session::spawn(
        &config,
        SessionDeps {
            broker: broker.clone(),
            predictor,
            repo,
            events: events.clone(),
            watchdog,
        },
    )
    .await
    {
        Ok(handle) => {
            registry.insert(key.clone(), handle).await;
        }
        // Trading is down but the ledger still needs healing: keep the
        // process up so reconciliation passes continue.
        Err(e) => {
            error!(error = %e, "Session failed to start; trading disabled, reconciliation keeps running");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(handle) = registry.remove(&key).await {
        handle.stop().await;
    }
    reconcile_task.abort();
    watchdog_task.abort();
    log_task.abort();

    info!("PulseBot stopped");
    Ok(())
}

/// One event-log row per session event
fn describe_event(event: &BotEvent) -> (&'static str, String) {
    match event {
        BotEvent::BarOpened { bar } => (
            "bar_opened",
            format!("start={} open={}", bar.start_epoch, bar.open),
        ),
        BotEvent::BarClosed { bar, forced } => (
            "bar_closed",
            format!("start={} close={} forced={}", bar.start_epoch, bar.close, forced),
        ),
        BotEvent::PredictionMade {
            prediction,
            trigger,
        } => (
            "prediction_made",
            format!(
                "direction={} predicted_close={} trigger={}",
                prediction.direction, prediction.predicted_close, trigger
            ),
        ),
        BotEvent::Armed { trigger, direction } => {
            ("armed", format!("direction={direction} trigger={trigger}"))
        }
        BotEvent::PositionEntered {
            position_id,
            contract_id,
            entry_price,
        } => (
            "position_entered",
            format!("id={position_id} contract={contract_id} entry={entry_price}"),
        ),
        BotEvent::PositionClosed { position_id, pnl } => {
            ("position_closed", format!("id={position_id} pnl={pnl}"))
        }
        BotEvent::HedgeOpened {
            position_id,
            parent_id,
            direction,
            stake,
        } => (
            "hedge_opened",
            format!("id={position_id} parent={parent_id} direction={direction} stake={stake}"),
        ),
        BotEvent::ReconcilePass { summary } => (
            "reconcile_pass",
            format!(
                "checked={} updated={} skipped={} deferred={} errors={}",
                summary.checked, summary.updated, summary.skipped, summary.deferred, summary.errors
            ),
        ),
        BotEvent::ConnectionState { state } => ("connection_state", state.to_string()),
        BotEvent::TickStall {
            last_tick_at,
            elapsed_secs,
        } => (
            "tick_stall",
            format!("last_tick_at={last_tick_at} elapsed_secs={elapsed_secs}"),
        ),
    }
}
