//! Typed errors for broker, prediction and persistence failures.
//!
//! `anyhow` is used at orchestration edges; these variants exist where the
//! caller needs to branch (timeouts, auth rejection, data integrity drops).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// A broker/prediction request exceeded its deadline
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    /// Authentication rejected by the broker; fatal for trading
    #[error("broker rejected authentication: {0}")]
    AuthRejected(String),

    /// Broker returned an application-level error for a request
    #[error("broker error on {operation}: {message}")]
    Broker {
        operation: &'static str,
        message: String,
    },

    /// Connection is not in a usable state for requests
    #[error("not connected to broker (state: {0})")]
    NotConnected(&'static str),

    /// The prediction service failed or returned garbage; never fatal
    #[error("prediction service: {0}")]
    Prediction(String),

    /// Persistence layer failure
    #[error("persistence: {0}")]
    Persistence(String),

    /// Malformed or out-of-order tick dropped by the candle builder
    #[error("invalid tick for {symbol}: {reason}")]
    InvalidTick { symbol: String, reason: String },

    /// Configuration invalid beyond what safe defaults can absorb
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BotError {
    /// Errors that must move the session to the Error state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BotError::AuthRejected(_) | BotError::InvalidConfig(_)
        )
    }
}

pub type BotResult<T> = Result<T, BotError>;
