//! Reconciliation Service
//!
//! Idempotently aligns the local position ledger with the broker's contract
//! ledger. Invariant: once a row has `reconciled = true` its pnl/status are
//! never touched again, so repeated passes (and crashes mid-pass) cannot
//! double-count a trade. Aggregates are always recomputed from
//! Closed+reconciled rows, never incremented.

use chrono::{Datelike, Duration, TimeZone, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::error::BotResult;
use crate::events::{BotEvent, EventBus};
use crate::persistence::Repository;
use crate::types::{PeriodMetrics, Position, PositionStatus};

/// Aggregate counts for one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub updated: usize,
    /// Already-reconciled rows the repository filter let through
    pub skipped: usize,
    /// Rows legitimately not resolvable yet: fresh Pending, open contracts
    pub deferred: usize,
    pub errors: usize,
}

pub struct Reconciler {
    broker: Arc<dyn BrokerClient>,
    repo: Arc<dyn Repository>,
    events: EventBus,
    /// Pending older than this with no contract is swept to Cancelled
    pending_stale_secs: i64,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        repo: Arc<dyn Repository>,
        events: EventBus,
        pending_stale_secs: i64,
    ) -> Self {
        Self {
            broker,
            repo,
            events,
            pending_stale_secs,
        }
    }

    /// One pass over all rows needing attention. A broker failure for one
    /// position never aborts the pass for the others.
    pub async fn run_pass(&self) -> BotResult<ReconcileSummary> {
        let rows = self.repo.unreconciled_positions().await?;
        let mut summary = ReconcileSummary::default();

        for mut position in rows {
            summary.checked += 1;

            if position.reconciled {
                // Repository filter should exclude these; never touch them.
                summary.skipped += 1;
                continue;
            }

            let outcome = self.reconcile_one(&mut position).await;
            match outcome {
                Ok(true) => summary.updated += 1,
                Ok(false) => summary.deferred += 1,
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        contract_id = ?position.contract_id,
                        error = %e,
                        "Reconciliation failed for position, continuing pass"
                    );
                    summary.errors += 1;
                }
            }
        }

        if summary.updated > 0 {
            self.recompute_metrics().await?;
        }

        info!(
            checked = summary.checked,
            updated = summary.updated,
            skipped = summary.skipped,
            deferred = summary.deferred,
            errors = summary.errors,
            "Reconciliation pass complete"
        );
        self.events.emit(BotEvent::ReconcilePass { summary });
        Ok(summary)
    }

    /// Returns Ok(true) when the row was updated
    async fn reconcile_one(&self, position: &mut Position) -> BotResult<bool> {
        let age_secs = (Utc::now() - position.opened_at).num_seconds();

        match (position.status, position.contract_id.clone()) {
            // Never confirmed and past the staleness window: the entry never
            // happened (or an orphan will surface via the broker ledger).
            (PositionStatus::Pending, None) | (PositionStatus::Cancelled, None) => {
                if age_secs < self.pending_stale_secs {
                    return Ok(false);
                }
                info!(
                    position_id = %position.id,
                    age_secs,
                    stale_secs = self.pending_stale_secs,
                    "Sweeping stale unconfirmed position to Cancelled"
                );
                position.status = PositionStatus::Cancelled;
                position.reconciled = true;
                self.repo.update_position(position).await?;
                Ok(true)
            }

            // Local record never advanced past the broker confirmation, or
            // is Entered/recently-Closed: the broker ledger decides.
            (_, Some(contract_id)) => {
                let info = self.broker.get_contract_info(&contract_id).await?;
                if !info.status.is_terminal() {
                    return Ok(false);
                }
                let pnl = info.realized_pnl().unwrap_or(0.0);
                if position.status == PositionStatus::Closed
                    && position.pnl.is_some()
                    && position.pnl != Some(pnl)
                {
                    warn!(
                        position_id = %position.id,
                        contract_id = %contract_id,
                        local_pnl = position.pnl,
                        broker_pnl = pnl,
                        "Local pnl disagrees with broker, broker wins"
                    );
                }
                position.status = PositionStatus::Closed;
                position.pnl = Some(pnl);
                if position.closed_at.is_none() {
                    position.closed_at = Some(Utc::now());
                }
                position.reconciled = true;
                self.repo.update_position(position).await?;
                Ok(true)
            }

            // Entered/Closed without a contract id cannot be matched against
            // the broker; sweep once stale, like an unconfirmed Pending.
            (status, None) => {
                if age_secs < self.pending_stale_secs {
                    return Ok(false);
                }
                warn!(
                    position_id = %position.id,
                    status = %status,
                    "Row without contract id past staleness window, cancelling"
                );
                position.status = PositionStatus::Cancelled;
                position.reconciled = true;
                self.repo.update_position(position).await?;
                Ok(true)
            }
        }
    }

    /// Rebuild today's and this month's aggregates from Closed+reconciled
    /// rows only. Full recompute keeps repeated passes idempotent.
    async fn recompute_metrics(&self) -> BotResult<()> {
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now - Duration::days(31));
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| Utc.from_utc_datetime(&d))
            .unwrap_or(now - Duration::days(1));

        let month_rows = self.repo.closed_reconciled_since(month_start).await?;
        let day_rows: Vec<&Position> = month_rows
            .iter()
            .filter(|p| p.closed_at.map(|t| t >= day_start).unwrap_or(false))
            .collect();

        let daily = aggregate(&now.format("%Y-%m-%d").to_string(), day_rows.iter().copied());
        let monthly = aggregate(&now.format("%Y-%m").to_string(), month_rows.iter());

        self.repo.upsert_metrics(&daily).await?;
        self.repo.upsert_metrics(&monthly).await?;
        info!(
            daily_trades = daily.total_trades,
            daily_pnl = daily.pnl,
            monthly_trades = monthly.total_trades,
            monthly_pnl = monthly.pnl,
            "Metrics recomputed from reconciled positions"
        );
        Ok(())
    }
}

fn aggregate<'a>(period: &str, rows: impl Iterator<Item = &'a Position>) -> PeriodMetrics {
    let mut metrics = PeriodMetrics {
        period: period.to_string(),
        ..Default::default()
    };
    for position in rows {
        let pnl = position.pnl.unwrap_or(0.0);
        metrics.total_trades += 1;
        // Break-even sells count toward the trade total only
        if pnl > 0.0 {
            metrics.wins += 1;
        } else if pnl < 0.0 {
            metrics.losses += 1;
        }
        metrics.pnl += pnl;
    }
    metrics
}
