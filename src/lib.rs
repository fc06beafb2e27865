//! PulseBot Library
//!
//! Automated per-bar trading session engine: tick stream aggregation,
//! close prediction, trigger entries, hedging and ledger reconciliation

pub mod broker;
pub mod candle;
pub mod config;
pub mod error;
pub mod events;
pub mod hedge;
pub mod persistence;
pub mod position;
pub mod prediction;
pub mod reconcile;
pub mod session;
pub mod types;
pub mod watchdog;
