//! Position Lifecycle Manager
//!
//! Opens, monitors and closes positions (primary and hedges) through the
//! broker client. The local row is always written *before* the broker is
//! contacted, so a crash between decision and broker call leaves a Pending
//! row for reconciliation instead of a lost trade.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, ContractOrder};
use crate::error::{BotError, BotResult};
use crate::events::{BotEvent, EventBus};
use crate::persistence::Repository;
use crate::types::{Direction, Position, PositionStatus};

/// What the monitor loop should do after one poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollAction {
    /// Contract still open, keep polling
    Continue,
    /// Contract reached a terminal state with this realized pnl
    Closed(f64),
}

pub struct PositionManager {
    broker: Arc<dyn BrokerClient>,
    repo: Arc<dyn Repository>,
    events: EventBus,
    /// Close early once unrealized profit reaches this fraction of max payout
    profit_take_pct: f64,
    /// Close an in-profit position when this little bar time remains
    final_close_margin_secs: i64,
}

impl PositionManager {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        repo: Arc<dyn Repository>,
        events: EventBus,
        profit_take_pct: f64,
        final_close_margin_secs: i64,
    ) -> Self {
        Self {
            broker,
            repo,
            events,
            profit_take_pct,
            final_close_margin_secs,
        }
    }

    /// Open a primary position. Pending row first, then the broker call;
    /// a failure marks the row Cancelled and is never retried (a duplicate
    /// entry doubles exposure).
    pub async fn open(
        &self,
        symbol: &str,
        direction: Direction,
        stake: f64,
        duration_secs: i64,
    ) -> BotResult<Position> {
        let position = Position::pending(symbol, direction, stake);
        self.enter(position, duration_secs).await
    }

    /// Open a hedge tied to a primary position
    pub async fn open_hedge(
        &self,
        parent: &Position,
        direction: Direction,
        stake: f64,
        duration_secs: i64,
    ) -> BotResult<Position> {
        let position = Position::pending_hedge(parent, direction, stake);
        let position = self.enter(position, duration_secs).await?;
        self.events.emit(BotEvent::HedgeOpened {
            position_id: position.id,
            parent_id: parent.id,
            direction,
            stake,
        });
        Ok(position)
    }

    async fn enter(&self, mut position: Position, duration_secs: i64) -> BotResult<Position> {
        let balance = self.broker.get_balance().await?;
        if position.stake > balance {
            return Err(BotError::Broker {
                operation: "buy_contract",
                message: format!(
                    "stake {:.2} exceeds balance {:.2}",
                    position.stake, balance
                ),
            });
        }

        // Stake must land on the broker's currency precision
        let pip = self
            .broker
            .get_symbol_info(&position.symbol)
            .await
            .map(|s| s.pip_size)
            .unwrap_or(0.01);
        position.stake = round_to_step(position.stake, pip.max(0.01));

        self.repo.insert_position(&position).await?;

        let order = ContractOrder {
            symbol: position.symbol.clone(),
            contract_type: position.direction.contract_type(),
            stake: position.stake,
            duration: duration_secs,
            duration_unit: "s",
            barrier: None,
        };

        match self.broker.buy_contract(&order).await {
            Ok(buy) => {
                position.status = PositionStatus::Entered;
                position.contract_id = Some(buy.contract_id.clone());
                position.entry_price = buy.entry_spot;
                self.repo.update_position(&position).await?;
                info!(
                    position_id = %position.id,
                    contract_id = %buy.contract_id,
                    direction = %position.direction,
                    stake = position.stake,
                    entry_price = buy.entry_spot,
                    payout = buy.payout,
                    "Position entered"
                );
                self.events.emit(BotEvent::PositionEntered {
                    position_id: position.id,
                    contract_id: buy.contract_id,
                    entry_price: buy.entry_spot,
                });
                Ok(position)
            }
            Err(e) => {
                // A timeout is ambiguous: the buy may have executed. Leave
                // the row unreconciled so the reconciliation pass can match
                // it against the broker ledger; an explicit rejection cannot
                // have produced a contract and is finalized here.
                let explicit_rejection = matches!(e, BotError::Broker { .. });
                position.status = PositionStatus::Cancelled;
                position.reconciled = explicit_rejection;
                self.repo.update_position(&position).await?;
                warn!(
                    position_id = %position.id,
                    error = %e,
                    explicit_rejection,
                    "Entry failed, position cancelled (no retry)"
                );
                Err(e)
            }
        }
    }

    /// One monitor poll over an Entered position
    pub async fn poll(
        &self,
        position: &mut Position,
        bar_end_epoch: i64,
        now_epoch: i64,
    ) -> BotResult<PollAction> {
        let contract_id = position
            .contract_id
            .clone()
            .ok_or_else(|| BotError::Broker {
                operation: "get_contract_info",
                message: "polling a position with no contract id".to_string(),
            })?;

        let info = self.broker.get_contract_info(&contract_id).await?;

        if info.status.is_terminal() {
            let pnl = info.realized_pnl().unwrap_or(0.0);
            self.finalize(position, pnl).await?;
            return Ok(PollAction::Closed(pnl));
        }

        let unrealized = info.bid_price.map(|bid| bid - info.buy_price);
        let max_profit = info.payout.map(|p| p - info.buy_price);

        // Early close on profit target
        if let (Some(unrealized), Some(max_profit)) = (unrealized, max_profit) {
            if max_profit > 0.0 && unrealized >= self.profit_take_pct * max_profit {
                info!(
                    position_id = %position.id,
                    unrealized,
                    max_profit,
                    profit_take_pct = self.profit_take_pct,
                    "Profit target reached, selling"
                );
                return self
                    .sell(position, &contract_id, info.bid_price.unwrap_or(0.0), info.buy_price)
                    .await;
            }
        }

        // Final safety margin: take any profit rather than gamble the expiry
        let remaining = bar_end_epoch - now_epoch;
        if remaining <= self.final_close_margin_secs {
            if let Some(unrealized) = unrealized {
                if unrealized > 0.0 {
                    info!(
                        position_id = %position.id,
                        remaining_secs = remaining,
                        unrealized,
                        "Inside final close margin while in profit, selling"
                    );
                    return self
                        .sell(position, &contract_id, info.bid_price.unwrap_or(0.0), info.buy_price)
                        .await;
                }
            }
        }

        Ok(PollAction::Continue)
    }

    async fn sell(
        &self,
        position: &mut Position,
        contract_id: &str,
        price: f64,
        buy_price: f64,
    ) -> BotResult<PollAction> {
        match self.broker.sell_contract(contract_id, price).await {
            Ok(sell) => {
                let pnl = sell.sold_for - buy_price;
                self.finalize(position, pnl).await?;
                Ok(PollAction::Closed(pnl))
            }
            Err(e) => {
                // The contract stays open; the next poll or reconciliation
                // pass resolves it.
                warn!(position_id = %position.id, error = %e, "Sell failed, leaving position open");
                Ok(PollAction::Continue)
            }
        }
    }

    async fn finalize(&self, position: &mut Position, pnl: f64) -> BotResult<()> {
        position.status = PositionStatus::Closed;
        position.pnl = Some(pnl);
        position.closed_at = Some(chrono::Utc::now());
        self.repo.update_position(position).await?;
        info!(position_id = %position.id, pnl, "Position closed");
        self.events.emit(BotEvent::PositionClosed {
            position_id: position.id,
            pnl,
        });
        Ok(())
    }

    /// Close every open position for the bar independently. Returns the sum
    /// of realized pnl over positions that reached a terminal state; the
    /// rest stay open for the next reconciliation pass.
    pub async fn close_all(
        &self,
        positions: &mut Vec<Position>,
        bar_end_epoch: i64,
        now_epoch: i64,
    ) -> f64 {
        let mut realized = 0.0;
        let mut unresolved: Vec<Uuid> = Vec::new();

        for position in positions.iter_mut() {
            if position.status != PositionStatus::Entered {
                continue;
            }
            match self.poll(position, bar_end_epoch, now_epoch).await {
                Ok(PollAction::Closed(pnl)) => realized += pnl,
                Ok(PollAction::Continue) => unresolved.push(position.id),
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "Close attempt failed");
                    unresolved.push(position.id);
                }
            }
        }

        if !unresolved.is_empty() {
            warn!(
                count = unresolved.len(),
                "Positions left open for reconciliation"
            );
        }
        realized
    }
}

/// Round down to the nearest multiple of `step`
fn round_to_step(value: f64, step: f64) -> f64 {
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BuyResult, ContractInfo, ContractStatus, MockBrokerClient, SymbolInfo};
    use crate::persistence::MemoryLedger;

    fn manager(broker: MockBrokerClient) -> (PositionManager, Arc<MemoryLedger>) {
        let repo = Arc::new(MemoryLedger::new());
        let mgr = PositionManager::new(
            Arc::new(broker),
            repo.clone(),
            EventBus::default(),
            0.8,
            20,
        );
        (mgr, repo)
    }

    fn expect_preamble(broker: &mut MockBrokerClient) {
        broker.expect_get_balance().returning(|| Ok(1000.0));
        broker.expect_get_symbol_info().returning(|s| {
            Ok(SymbolInfo {
                symbol: s.to_string(),
                pip_size: 0.01,
            })
        });
    }

    #[tokio::test]
    async fn test_open_persists_pending_before_entry() {
        let mut broker = MockBrokerClient::new();
        expect_preamble(&mut broker);
        broker.expect_buy_contract().returning(|order| {
            assert_eq!(order.contract_type, "CALL");
            Ok(BuyResult {
                contract_id: "c-1".to_string(),
                buy_price: 10.0,
                payout: 18.0,
                entry_spot: 100.5,
            })
        });

        let (mgr, repo) = manager(broker);
        let position = mgr.open("R_100", Direction::Up, 10.0, 240).await.unwrap();

        assert_eq!(position.status, PositionStatus::Entered);
        assert_eq!(position.contract_id.as_deref(), Some("c-1"));
        assert_eq!(position.entry_price, 100.5);
        let stored = repo.get_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Entered);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_cancelled_and_reconciled() {
        let mut broker = MockBrokerClient::new();
        expect_preamble(&mut broker);
        broker.expect_buy_contract().returning(|_| {
            Err(BotError::Broker {
                operation: "buy_contract",
                message: "market closed".to_string(),
            })
        });

        let (mgr, repo) = manager(broker);
        let err = mgr.open("R_100", Direction::Up, 10.0, 240).await.unwrap_err();
        assert!(matches!(err, BotError::Broker { .. }));

        let rows = repo.unreconciled_positions().await.unwrap();
        assert!(rows.is_empty(), "explicit rejection is finalized locally");
    }

    #[tokio::test]
    async fn test_timed_out_entry_stays_unreconciled() {
        let mut broker = MockBrokerClient::new();
        expect_preamble(&mut broker);
        broker.expect_buy_contract().returning(|_| {
            Err(BotError::Timeout {
                operation: "buy_contract",
                timeout_secs: 20,
            })
        });

        let (mgr, repo) = manager(broker);
        mgr.open("R_100", Direction::Up, 10.0, 240).await.unwrap_err();

        let rows = repo.unreconciled_positions().await.unwrap();
        assert_eq!(rows.len(), 1, "ambiguous failure is left for reconciliation");
        assert_eq!(rows[0].status, PositionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_insufficient_balance_blocks_entry() {
        let mut broker = MockBrokerClient::new();
        broker.expect_get_balance().returning(|| Ok(5.0));

        let (mgr, repo) = manager(broker);
        let err = mgr.open("R_100", Direction::Up, 10.0, 240).await.unwrap_err();
        assert!(matches!(err, BotError::Broker { .. }));
        assert!(repo.unreconciled_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_closes_on_terminal_contract() {
        let mut broker = MockBrokerClient::new();
        broker.expect_get_contract_info().returning(|_| {
            Ok(ContractInfo {
                contract_id: "c-1".to_string(),
                status: ContractStatus::Won,
                buy_price: 10.0,
                sell_price: None,
                payout: Some(18.0),
                bid_price: None,
                exit_tick: Some(101.0),
            })
        });

        let (mgr, repo) = manager(broker);
        let mut position = Position::pending("R_100", Direction::Up, 10.0);
        position.status = PositionStatus::Entered;
        position.contract_id = Some("c-1".to_string());
        repo.insert_position(&position).await.unwrap();

        let action = mgr.poll(&mut position, 2_000, 1_000).await.unwrap();
        assert_eq!(action, PollAction::Closed(8.0));
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.pnl, Some(8.0));
    }

    #[tokio::test]
    async fn test_poll_sells_at_profit_target() {
        let mut broker = MockBrokerClient::new();
        broker.expect_get_contract_info().returning(|_| {
            Ok(ContractInfo {
                contract_id: "c-1".to_string(),
                status: ContractStatus::Open,
                buy_price: 10.0,
                sell_price: None,
                payout: Some(18.0),
                // unrealized 6.5 >= 0.8 * 8.0
                bid_price: Some(16.5),
                exit_tick: None,
            })
        });
        broker
            .expect_sell_contract()
            .returning(|id, price| {
                Ok(crate::broker::SellResult {
                    contract_id: id.to_string(),
                    sold_for: price,
                })
            });

        let (mgr, repo) = manager(broker);
        let mut position = Position::pending("R_100", Direction::Up, 10.0);
        position.status = PositionStatus::Entered;
        position.contract_id = Some("c-1".to_string());
        repo.insert_position(&position).await.unwrap();

        let action = mgr.poll(&mut position, 2_000, 1_000).await.unwrap();
        assert_eq!(action, PollAction::Closed(6.5));
    }

    #[tokio::test]
    async fn test_close_all_keeps_unresolved_open() {
        let mut broker = MockBrokerClient::new();
        broker.expect_get_contract_info().returning(|id| {
            if id == "c-won" {
                Ok(ContractInfo {
                    contract_id: id.to_string(),
                    status: ContractStatus::Won,
                    buy_price: 10.0,
                    sell_price: None,
                    payout: Some(18.0),
                    bid_price: None,
                    exit_tick: None,
                })
            } else {
                Err(BotError::Timeout {
                    operation: "get_contract_info",
                    timeout_secs: 20,
                })
            }
        });

        let (mgr, repo) = manager(broker);
        let mut a = Position::pending("R_100", Direction::Up, 10.0);
        a.status = PositionStatus::Entered;
        a.contract_id = Some("c-won".to_string());
        let mut b = Position::pending("R_100", Direction::Down, 10.0);
        b.status = PositionStatus::Entered;
        b.contract_id = Some("c-stuck".to_string());
        repo.insert_position(&a).await.unwrap();
        repo.insert_position(&b).await.unwrap();

        let mut open = vec![a, b];
        let realized = mgr.close_all(&mut open, 2_000, 1_990).await;

        assert_eq!(realized, 8.0, "only terminal positions counted");
        assert_eq!(open[1].status, PositionStatus::Entered, "stuck one left open");
    }
}
