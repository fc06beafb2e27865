//! Prediction service client
//!
//! The model is a black box behind HTTP: we send bounded history plus the
//! partial current bar and get back a directional close prediction. Failures
//! are tolerated by callers; a bad prediction round only skips the bar.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::PredictionConfig;
use crate::error::{BotError, BotResult};
use crate::types::{Bar, Direction, Prediction};

/// Black-box scoring function seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        symbol: &str,
        timeframe_label: &str,
        history: &[Bar],
        partial_bar: &Bar,
    ) -> BotResult<Prediction>;
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    history: &'a [Bar],
    partial_bar: &'a Bar,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    direction: String,
    predicted_close: f64,
    #[serde(default)]
    phase: String,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    confidence: f64,
}

/// HTTP client for the external prediction service
pub struct PredictionClient {
    client: reqwest::Client,
    url: String,
    history_bars: usize,
}

impl PredictionClient {
    pub fn new(config: &PredictionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create prediction HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            history_bars: config.history_bars,
        })
    }
}

#[async_trait]
impl Predictor for PredictionClient {
    async fn predict(
        &self,
        symbol: &str,
        timeframe_label: &str,
        history: &[Bar],
        partial_bar: &Bar,
    ) -> BotResult<Prediction> {
        // Bound the history we ship regardless of what the caller holds
        let start = history.len().saturating_sub(self.history_bars);
        let request = PredictRequest {
            symbol,
            timeframe: timeframe_label,
            history: &history[start..],
            partial_bar,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BotError::Prediction(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BotError::Prediction(format!(
                "service returned {}",
                response.status()
            )));
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| BotError::Prediction(format!("malformed response: {e}")))?;

        let direction = match body.direction.to_lowercase().as_str() {
            "up" => Direction::Up,
            "down" => Direction::Down,
            other => {
                return Err(BotError::Prediction(format!(
                    "unknown direction '{other}'"
                )))
            }
        };

        if !body.predicted_close.is_finite() || body.predicted_close <= 0.0 {
            return Err(BotError::Prediction(format!(
                "nonsensical predicted close {}",
                body.predicted_close
            )));
        }

        Ok(Prediction {
            direction,
            predicted_close: body.predicted_close,
            phase: body.phase,
            strategy: body.strategy,
            confidence: body.confidence,
        })
    }
}
