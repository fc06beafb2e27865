//! Broker client seam.
//!
//! The wire protocol lives behind [`BrokerClient`]; the session, position
//! lifecycle and reconciliation only see this trait. The production
//! implementation is [`connection::ConnectionManager`].

pub mod connection;

pub use connection::{ConnectionManager, ConnectionState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BotResult;
use crate::types::{Bar, Tick, Timeframe};

/// Parameters for a contract purchase
#[derive(Debug, Clone, Serialize)]
pub struct ContractOrder {
    pub symbol: String,
    /// "CALL" or "PUT"
    pub contract_type: &'static str,
    pub stake: f64,
    pub duration: i64,
    /// "s" seconds or "m" minutes
    pub duration_unit: &'static str,
    /// Optional barrier offset; None for at-the-money contracts
    pub barrier: Option<f64>,
}

/// Broker confirmation of a purchase
#[derive(Debug, Clone, Deserialize)]
pub struct BuyResult {
    pub contract_id: String,
    pub buy_price: f64,
    /// Maximum payout if the contract wins
    pub payout: f64,
    /// Entry spot reported by the broker
    pub entry_spot: f64,
}

/// Broker confirmation of an early sell
#[derive(Debug, Clone, Deserialize)]
pub struct SellResult {
    pub contract_id: String,
    pub sold_for: f64,
}

/// Terminal or live contract state as the broker reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Open,
    Won,
    Lost,
    Sold,
}

impl ContractStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContractStatus::Open)
    }
}

/// Snapshot of one contract from the broker ledger
#[derive(Debug, Clone, Deserialize)]
pub struct ContractInfo {
    pub contract_id: String,
    pub status: ContractStatus,
    pub buy_price: f64,
    pub sell_price: Option<f64>,
    pub payout: Option<f64>,
    /// Current unrealized value while open
    pub bid_price: Option<f64>,
    pub exit_tick: Option<f64>,
}

impl ContractInfo {
    /// Realized pnl per the broker ledger: won = payout(or sell) - buy,
    /// lost = -buy, sold = sell - buy. None while still open.
    pub fn realized_pnl(&self) -> Option<f64> {
        match self.status {
            ContractStatus::Open => None,
            ContractStatus::Won => {
                let credit = self.payout.or(self.sell_price).unwrap_or(0.0);
                Some(credit - self.buy_price)
            }
            ContractStatus::Lost => Some(-self.buy_price),
            ContractStatus::Sold => Some(self.sell_price.unwrap_or(0.0) - self.buy_price),
        }
    }
}

/// Symbol metadata
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Smallest price increment (e.g. 0.01)
    pub pip_size: f64,
}

/// Request/response surface to the broker. Every call is timeout-guarded by
/// the implementation and returns a typed error instead of hanging.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> BotResult<()>;

    async fn disconnect(&self) -> BotResult<()>;

    /// Subscribe to the live tick stream. The subscription survives
    /// reconnects: the connection layer replays it and keeps feeding the
    /// same receiver.
    async fn subscribe_ticks(&self, symbol: &str) -> BotResult<mpsc::Receiver<Tick>>;

    /// Most recent `count` bars, last element being the bar in progress
    async fn get_candle_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> BotResult<Vec<Bar>>;

    async fn buy_contract(&self, order: &ContractOrder) -> BotResult<BuyResult>;

    async fn sell_contract(&self, contract_id: &str, price: f64) -> BotResult<SellResult>;

    async fn get_contract_info(&self, contract_id: &str) -> BotResult<ContractInfo>;

    async fn get_balance(&self) -> BotResult<f64>;

    async fn get_symbol_info(&self, symbol: &str) -> BotResult<SymbolInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: ContractStatus) -> ContractInfo {
        ContractInfo {
            contract_id: "c1".to_string(),
            status,
            buy_price: 10.0,
            sell_price: Some(14.0),
            payout: Some(18.0),
            bid_price: None,
            exit_tick: None,
        }
    }

    #[test]
    fn test_realized_pnl_rules() {
        assert_eq!(info(ContractStatus::Won).realized_pnl(), Some(8.0));
        assert_eq!(info(ContractStatus::Lost).realized_pnl(), Some(-10.0));
        assert_eq!(info(ContractStatus::Sold).realized_pnl(), Some(4.0));
        assert_eq!(info(ContractStatus::Open).realized_pnl(), None);
    }

    #[test]
    fn test_won_without_payout_falls_back_to_sell() {
        let mut i = info(ContractStatus::Won);
        i.payout = None;
        assert_eq!(i.realized_pnl(), Some(4.0));
    }
}
