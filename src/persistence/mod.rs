//! Position ledger persistence
//!
//! The core only sees the [`Repository`] trait: position CRUD, metric
//! upsert/get and event-log append. `CsvLedger` is the file-backed
//! implementation (CSV rows, rewrite-on-update for the ledger, append-only
//! for the event log); `MemoryLedger` backs tests. Both serialize writes
//! through one async RwLock so a reconciliation pass and a live close cannot
//! race on the same row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BotError, BotResult};
use crate::types::{Direction, PeriodMetrics, Position, PositionStatus};

/// Persistence seam for the session and reconciliation service
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_position(&self, position: &Position) -> BotResult<()>;

    /// Full-row update keyed by position id
    async fn update_position(&self, position: &Position) -> BotResult<()>;

    async fn get_position(&self, id: Uuid) -> BotResult<Option<Position>>;

    async fn get_by_contract(&self, contract_id: &str) -> BotResult<Option<Position>>;

    /// Rows a reconciliation pass must look at: anything not yet reconciled
    async fn unreconciled_positions(&self) -> BotResult<Vec<Position>>;

    /// Closed and reconciled rows with `closed_at >= since`; metrics are
    /// derived exclusively from these
    async fn closed_reconciled_since(&self, since: DateTime<Utc>) -> BotResult<Vec<Position>>;

    async fn upsert_metrics(&self, metrics: &PeriodMetrics) -> BotResult<()>;

    async fn get_metrics(&self, period: &str) -> BotResult<Option<PeriodMetrics>>;

    /// Append one line to the observability event log
    async fn append_event(&self, kind: &str, detail: &str) -> BotResult<()>;
}

/// Position row as stored in CSV
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PositionRecord {
    id: String,
    contract_id: Option<String>,
    symbol: String,
    direction: String,
    stake: f64,
    entry_price: f64,
    status: String,
    is_hedge: bool,
    parent_id: Option<String>,
    reconciled: bool,
    pnl: Option<f64>,
    opened_at: i64,
    closed_at: Option<i64>,
}

impl PositionRecord {
    fn from_position(p: &Position) -> Self {
        Self {
            id: p.id.to_string(),
            contract_id: p.contract_id.clone(),
            symbol: p.symbol.clone(),
            direction: p.direction.to_string(),
            stake: p.stake,
            entry_price: p.entry_price,
            status: p.status.to_string(),
            is_hedge: p.is_hedge,
            parent_id: p.parent_id.map(|id| id.to_string()),
            reconciled: p.reconciled,
            pnl: p.pnl,
            opened_at: p.opened_at.timestamp_millis(),
            closed_at: p.closed_at.map(|t| t.timestamp_millis()),
        }
    }

    fn into_position(self) -> Result<Position> {
        Ok(Position {
            id: Uuid::parse_str(&self.id).context("bad position id")?,
            contract_id: self.contract_id,
            symbol: self.symbol,
            direction: match self.direction.as_str() {
                "UP" => Direction::Up,
                "DOWN" => Direction::Down,
                other => anyhow::bail!("bad direction '{other}'"),
            },
            stake: self.stake,
            entry_price: self.entry_price,
            status: PositionStatus::parse(&self.status)
                .with_context(|| format!("bad status '{}'", self.status))?,
            is_hedge: self.is_hedge,
            parent_id: self
                .parent_id
                .map(|id| Uuid::parse_str(&id))
                .transpose()
                .context("bad parent id")?,
            reconciled: self.reconciled,
            pnl: self.pnl,
            opened_at: DateTime::from_timestamp_millis(self.opened_at)
                .context("bad opened_at")?,
            closed_at: self
                .closed_at
                .map(DateTime::from_timestamp_millis)
                .map(|t| t.context("bad closed_at"))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecord {
    timestamp: i64,
    kind: String,
    detail: String,
}

#[derive(Default)]
struct LedgerState {
    positions: HashMap<Uuid, Position>,
    metrics: HashMap<String, PeriodMetrics>,
}

fn persistence_err(e: impl std::fmt::Display) -> BotError {
    BotError::Persistence(e.to_string())
}

/// CSV-backed ledger. Positions and metrics are rewritten atomically on
/// change (temp file + rename); the event log is append-only.
pub struct CsvLedger {
    data_dir: PathBuf,
    state: RwLock<LedgerState>,
    event_log_enabled: bool,
}

impl CsvLedger {
    pub fn open(data_dir: &str, event_log_enabled: bool) -> Result<Self> {
        let dir = PathBuf::from(data_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;

        let mut state = LedgerState::default();
        let positions_path = dir.join("positions.csv");
        if positions_path.exists() {
            for record in Self::read_csv::<PositionRecord>(&positions_path)? {
                let position = record.into_position()?;
                state.positions.insert(position.id, position);
            }
        }
        let metrics_path = dir.join("metrics.csv");
        if metrics_path.exists() {
            for metrics in Self::read_csv::<PeriodMetrics>(&metrics_path)? {
                state.metrics.insert(metrics.period.clone(), metrics);
            }
        }

        info!(
            data_dir = %dir.display(),
            positions = state.positions.len(),
            "Ledger loaded"
        );
        Ok(Self {
            data_dir: dir,
            state: RwLock::new(state),
            event_log_enabled,
        })
    }

    fn read_csv<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut rows = Vec::new();
        for result in reader.deserialize() {
            rows.push(result.with_context(|| format!("Bad row in {}", path.display()))?);
        }
        Ok(rows)
    }

    fn write_csv<T: Serialize>(path: &Path, rows: impl Iterator<Item = T>) -> Result<()> {
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = WriterBuilder::new()
                .has_headers(true)
                .from_path(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn flush_positions(&self, state: &LedgerState) -> Result<()> {
        let mut rows: Vec<_> = state.positions.values().collect();
        rows.sort_by_key(|p| p.opened_at);
        Self::write_csv(
            &self.data_dir.join("positions.csv"),
            rows.into_iter().map(PositionRecord::from_position),
        )
    }

    fn flush_metrics(&self, state: &LedgerState) -> Result<()> {
        let mut rows: Vec<_> = state.metrics.values().cloned().collect();
        rows.sort_by(|a, b| a.period.cmp(&b.period));
        Self::write_csv(&self.data_dir.join("metrics.csv"), rows.into_iter())
    }
}

#[async_trait]
impl Repository for CsvLedger {
    async fn insert_position(&self, position: &Position) -> BotResult<()> {
        let mut state = self.state.write().await;
        state.positions.insert(position.id, position.clone());
        self.flush_positions(&state).map_err(persistence_err)
    }

    async fn update_position(&self, position: &Position) -> BotResult<()> {
        let mut state = self.state.write().await;
        match state.positions.get(&position.id) {
            None => {
                return Err(BotError::Persistence(format!(
                    "update for unknown position {}",
                    position.id
                )))
            }
            // Reconciled rows are frozen: a late live close working from a
            // stale copy must not rewrite the recorded outcome.
            Some(stored) if stored.reconciled => {
                warn!(
                    position_id = %position.id,
                    "Ignoring update to a reconciled row"
                );
                return Ok(());
            }
            Some(_) => {}
        }
        state.positions.insert(position.id, position.clone());
        self.flush_positions(&state).map_err(persistence_err)
    }

    async fn get_position(&self, id: Uuid) -> BotResult<Option<Position>> {
        Ok(self.state.read().await.positions.get(&id).cloned())
    }

    async fn get_by_contract(&self, contract_id: &str) -> BotResult<Option<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .find(|p| p.contract_id.as_deref() == Some(contract_id))
            .cloned())
    }

    async fn unreconciled_positions(&self) -> BotResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| !p.reconciled)
            .cloned()
            .collect())
    }

    async fn closed_reconciled_since(&self, since: DateTime<Utc>) -> BotResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| {
                p.reconciled
                    && p.status == PositionStatus::Closed
                    && p.closed_at.map(|t| t >= since).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn upsert_metrics(&self, metrics: &PeriodMetrics) -> BotResult<()> {
        let mut state = self.state.write().await;
        state
            .metrics
            .insert(metrics.period.clone(), metrics.clone());
        self.flush_metrics(&state).map_err(persistence_err)
    }

    async fn get_metrics(&self, period: &str) -> BotResult<Option<PeriodMetrics>> {
        Ok(self.state.read().await.metrics.get(period).cloned())
    }

    async fn append_event(&self, kind: &str, detail: &str) -> BotResult<()> {
        if !self.event_log_enabled {
            return Ok(());
        }
        let path = self.data_dir.join("events.csv");
        let new_file = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(persistence_err)?;
        let mut writer = WriterBuilder::new().has_headers(new_file).from_writer(file);
        writer
            .serialize(EventRecord {
                timestamp: Utc::now().timestamp_millis(),
                kind: kind.to_string(),
                detail: detail.to_string(),
            })
            .map_err(persistence_err)?;
        writer.flush().map_err(persistence_err)
    }
}

/// In-memory ledger for tests and dry runs
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    events: RwLock<Vec<(String, String)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl Repository for MemoryLedger {
    async fn insert_position(&self, position: &Position) -> BotResult<()> {
        self.state
            .write()
            .await
            .positions
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> BotResult<()> {
        let mut state = self.state.write().await;
        match state.positions.get(&position.id) {
            None => {
                return Err(BotError::Persistence(format!(
                    "update for unknown position {}",
                    position.id
                )))
            }
            Some(stored) if stored.reconciled => {
                warn!(
                    position_id = %position.id,
                    "Ignoring update to a reconciled row"
                );
                return Ok(());
            }
            Some(_) => {}
        }
        state.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn get_position(&self, id: Uuid) -> BotResult<Option<Position>> {
        Ok(self.state.read().await.positions.get(&id).cloned())
    }

    async fn get_by_contract(&self, contract_id: &str) -> BotResult<Option<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .find(|p| p.contract_id.as_deref() == Some(contract_id))
            .cloned())
    }

    async fn unreconciled_positions(&self) -> BotResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| !p.reconciled)
            .cloned()
            .collect())
    }

    async fn closed_reconciled_since(&self, since: DateTime<Utc>) -> BotResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| {
                p.reconciled
                    && p.status == PositionStatus::Closed
                    && p.closed_at.map(|t| t >= since).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn upsert_metrics(&self, metrics: &PeriodMetrics) -> BotResult<()> {
        self.state
            .write()
            .await
            .metrics
            .insert(metrics.period.clone(), metrics.clone());
        Ok(())
    }

    async fn get_metrics(&self, period: &str) -> BotResult<Option<PeriodMetrics>> {
        Ok(self.state.read().await.metrics.get(period).cloned())
    }

    async fn append_event(&self, kind: &str, detail: &str) -> BotResult<()> {
        self.events
            .write()
            .await
            .push((kind.to_string(), detail.to_string()));
        Ok(())
    }
}
