//! Connection Manager - persistent WebSocket session to the broker
//!
//! Owns the stream lifecycle: auth handshake, heartbeat, exponential-backoff
//! reconnect and subscription replay. Request/response calls are correlated
//! by `req_id` and individually timeout-guarded; tick pushes are fanned out
//! to per-symbol subscription channels that survive reconnects.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::{interval, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{BotError, BotResult};
use crate::events::{BotEvent, EventBus};
use crate::types::{Bar, Tick, Timeframe};

use super::{
    BrokerClient, BuyResult, ContractInfo, ContractOrder, SellResult, SymbolInfo,
};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Capped exponential backoff: base doubling per attempt up to max
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    std::cmp::min(base * 2u32.pow(exp), max)
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Outbound request routed to the io task
struct PendingRequest {
    payload: Value,
    reply: oneshot::Sender<BotResult<Value>>,
}

struct Shared {
    /// In-flight requests awaiting a correlated response
    pending: Mutex<HashMap<u64, oneshot::Sender<BotResult<Value>>>>,
    /// Active tick subscriptions, replayed after every reconnect
    subscriptions: Mutex<HashMap<String, mpsc::Sender<Tick>>>,
    /// Set once when the broker rejects authentication; fatal
    auth_error: Mutex<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
    req_seq: AtomicU64,
    shutdown: Notify,
}

/// Production [`BrokerClient`] over a persistent WebSocket
pub struct ConnectionManager {
    config: ConnectionConfig,
    token: String,
    events: EventBus,
    shared: Arc<Shared>,
    request_tx: mpsc::Sender<PendingRequest>,
    request_rx: Mutex<Option<mpsc::Receiver<PendingRequest>>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, token: String, events: EventBus) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (request_tx, request_rx) = mpsc::channel(64);
        Self {
            config,
            token,
            events,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                auth_error: Mutex::new(None),
                state_tx,
                req_seq: AtomicU64::new(1),
                shutdown: Notify::new(),
            }),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            state_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn set_state(shared: &Shared, events: &EventBus, state: ConnectionState) {
        let _ = shared.state_tx.send(state);
        events.emit(BotEvent::ConnectionState {
            state: state.as_str(),
        });
    }

    /// Issue one correlated request with the configured per-call timeout
    async fn request(&self, operation: &'static str, mut payload: Value) -> BotResult<Value> {
        let req_id = self.shared.req_seq.fetch_add(1, Ordering::Relaxed);
        payload["req_id"] = json!(req_id);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(PendingRequest {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BotError::NotConnected("io task stopped"))?;

        let timeout_secs = self.config.request_timeout_secs;
        match timeout(Duration::from_secs(timeout_secs), reply_rx).await {
            Err(_) => Err(BotError::Timeout {
                operation,
                timeout_secs,
            }),
            Ok(Err(_)) => Err(BotError::NotConnected("request dropped on disconnect")),
            Ok(Ok(result)) => result,
        }
    }

    async fn typed_request<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        payload: Value,
    ) -> BotResult<T> {
        let value = self.request(operation, payload).await?;
        serde_json::from_value(value).map_err(|e| BotError::Broker {
            operation,
            message: format!("malformed response: {e}"),
        })
    }

    /// The io task: reconnect loop with capped exponential backoff.
    /// Runs until authentication is rejected or `disconnect` is called.
    async fn run_io(
        shared: Arc<Shared>,
        events: EventBus,
        config: ConnectionConfig,
        token: String,
        mut request_rx: mpsc::Receiver<PendingRequest>,
    ) {
        let base_delay = Duration::from_secs(config.reconnect_base_secs.max(1));
        let max_delay = Duration::from_secs(config.reconnect_max_secs.max(1));
        let mut attempt = 0u32;

        'reconnect: loop {
            Self::set_state(&shared, &events, ConnectionState::Connecting);
            info!(url = %config.ws_url, attempt, "Connecting to broker WebSocket...");

            let ws_stream = match connect_async(&config.ws_url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "Broker connection failed");
                    Self::set_state(&shared, &events, ConnectionState::Disconnected);
                    attempt += 1;
                    let delay = backoff_delay(base_delay, max_delay, attempt);
                    info!(delay_secs = delay.as_secs(), "Reconnecting in {} seconds...", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                }
            };

            let (mut write, mut read) = ws_stream.split();

            // Auth handshake must complete before the connection is usable
            Self::set_state(&shared, &events, ConnectionState::Authenticating);
            let auth_req_id = shared.req_seq.fetch_add(1, Ordering::Relaxed);
            let auth = json!({
                "req_id": auth_req_id,
                "method": "authorize",
                "params": { "token": token },
            });
            if write.send(Message::Text(auth.to_string())).await.is_err() {
                warn!("Failed to send authorize, reconnecting");
                continue 'reconnect;
            }

            match Self::await_auth(&mut read, auth_req_id, config.request_timeout_secs).await {
                Ok(()) => {
                    info!("Broker authentication confirmed");
                }
                Err(BotError::AuthRejected(reason)) => {
                    error!(reason = %reason, "Broker rejected authentication, stopping connection task");
                    *shared.auth_error.lock().await = Some(reason);
                    Self::set_state(&shared, &events, ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Authentication attempt failed, reconnecting");
                    continue 'reconnect;
                }
            }

            Self::set_state(&shared, &events, ConnectionState::Connected);
            attempt = 0;

            // Replay every active subscription exactly once
            {
                let subs = shared.subscriptions.lock().await;
                for symbol in subs.keys() {
                    let req_id = shared.req_seq.fetch_add(1, Ordering::Relaxed);
                    let sub = json!({
                        "req_id": req_id,
                        "method": "subscribe_ticks",
                        "params": { "symbol": symbol },
                    });
                    if write.send(Message::Text(sub.to_string())).await.is_err() {
                        warn!(symbol = %symbol, "Subscription replay failed, reconnecting");
                        continue 'reconnect;
                    }
                    info!(symbol = %symbol, "Replayed tick subscription");
                }
            }

            let mut heartbeat = interval(Duration::from_secs(config.heartbeat_secs.max(1)));
            heartbeat.tick().await; // first tick fires immediately
            let grace = Duration::from_secs(config.heartbeat_secs + config.heartbeat_grace_secs);
            let mut last_pong = Instant::now();

            let reconnect = loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::route_message(&shared, &text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("Connection closed by broker");
                            break true;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break true;
                        }
                        None => {
                            warn!("Broker stream ended");
                            break true;
                        }
                        _ => {}
                    },
                    req = request_rx.recv() => match req {
                        Some(PendingRequest { payload, reply }) => {
                            let req_id = payload["req_id"].as_u64().unwrap_or(0);
                            shared.pending.lock().await.insert(req_id, reply);
                            if write.send(Message::Text(payload.to_string())).await.is_err() {
                                if let Some(tx) = shared.pending.lock().await.remove(&req_id) {
                                    let _ = tx.send(Err(BotError::NotConnected("send failed")));
                                }
                                break true;
                            }
                        }
                        None => {
                            info!("Request channel closed, shutting down connection");
                            let _ = write.send(Message::Close(None)).await;
                            break false;
                        }
                    },
                    _ = shared.shutdown.notified() => {
                        info!("Disconnect requested, closing connection");
                        let _ = write.send(Message::Close(None)).await;
                        break false;
                    },
                    _ = heartbeat.tick() => {
                        // Missing pong within the grace window: treat as dead
                        // rather than wait for a transport-level failure.
                        if last_pong.elapsed() > grace {
                            warn!(
                                elapsed_secs = last_pong.elapsed().as_secs(),
                                grace_secs = grace.as_secs(),
                                "Heartbeat unacknowledged, closing connection"
                            );
                            let _ = write.send(Message::Close(None)).await;
                            break true;
                        }
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break true;
                        }
                    },
                }
            };

            // Fail everything in flight; callers see an explicit error and
            // must not be silently retried (duplicate entry risk).
            let mut pending = shared.pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(BotError::NotConnected("connection lost")));
            }
            drop(pending);
            Self::set_state(&shared, &events, ConnectionState::Disconnected);

            if !reconnect {
                return;
            }
            attempt += 1;
            let delay = backoff_delay(base_delay, max_delay, attempt);
            info!(
                delay_secs = delay.as_secs(),
                attempt, "Reconnecting in {} seconds...", delay.as_secs()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for the authorize response before anything else is processed
    async fn await_auth(
        read: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        auth_req_id: u64,
        timeout_secs: u64,
    ) -> BotResult<()> {
        let deadline = Duration::from_secs(timeout_secs);
        let auth_wait = async {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(BotError::Broker {
                            operation: "authorize",
                            message: e.to_string(),
                        })
                    }
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if value["req_id"].as_u64() != Some(auth_req_id) {
                    continue;
                }
                if let Some(err) = value.get("error") {
                    let message = err["message"].as_str().unwrap_or("unknown").to_string();
                    return Err(BotError::AuthRejected(message));
                }
                return Ok(());
            }
            Err(BotError::Broker {
                operation: "authorize",
                message: "stream ended during auth".to_string(),
            })
        };

        match timeout(deadline, auth_wait).await {
            Ok(result) => result,
            Err(_) => Err(BotError::Timeout {
                operation: "authorize",
                timeout_secs,
            }),
        }
    }

    /// Route one inbound text frame: correlated response or tick push
    async fn route_message(shared: &Shared, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable broker frame");
                return;
            }
        };

        if let Some(req_id) = value["req_id"].as_u64() {
            if let Some(reply) = shared.pending.lock().await.remove(&req_id) {
                let result = if let Some(err) = value.get("error") {
                    Err(BotError::Broker {
                        operation: "request",
                        message: err["message"].as_str().unwrap_or("unknown").to_string(),
                    })
                } else {
                    Ok(value["result"].clone())
                };
                let _ = reply.send(result);
            }
            return;
        }

        if value["msg_type"].as_str() == Some("tick") {
            let tick = Tick {
                symbol: value["tick"]["symbol"].as_str().unwrap_or("").to_string(),
                epoch: value["tick"]["epoch"].as_i64().unwrap_or(0),
                price: value["tick"]["quote"].as_f64().unwrap_or(f64::NAN),
            };
            let subs = shared.subscriptions.lock().await;
            if let Some(tx) = subs.get(&tick.symbol) {
                if tx.try_send(tick).is_err() {
                    warn!("Tick consumer lagging, dropping tick");
                }
            }
        }
    }
}

#[async_trait]
impl BrokerClient for ConnectionManager {
    async fn connect(&self) -> BotResult<()> {
        let Some(request_rx) = self.request_rx.lock().await.take() else {
            // io task already running
            return Ok(());
        };

        tokio::spawn(Self::run_io(
            Arc::clone(&self.shared),
            self.events.clone(),
            self.config.clone(),
            self.token.clone(),
            request_rx,
        ));

        // Wait for the first successful handshake or a fatal auth rejection
        let mut state_rx = self.state_rx.clone();
        let deadline = Duration::from_secs(self.config.request_timeout_secs * 2);
        let wait = async {
            loop {
                if *state_rx.borrow() == ConnectionState::Connected {
                    return Ok(());
                }
                if let Some(reason) = self.shared.auth_error.lock().await.clone() {
                    return Err(BotError::AuthRejected(reason));
                }
                if state_rx.changed().await.is_err() {
                    return Err(BotError::NotConnected("io task stopped"));
                }
            }
        };
        match timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(BotError::Timeout {
                operation: "connect",
                timeout_secs: deadline.as_secs(),
            }),
        }
    }

    async fn disconnect(&self) -> BotResult<()> {
        self.shared.shutdown.notify_one();
        Ok(())
    }

    async fn subscribe_ticks(&self, symbol: &str) -> BotResult<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(1024);
        self.shared
            .subscriptions
            .lock()
            .await
            .insert(symbol.to_string(), tx);

        self.request(
            "subscribe_ticks",
            json!({ "method": "subscribe_ticks", "params": { "symbol": symbol } }),
        )
        .await?;
        Ok(rx)
    }

    async fn get_candle_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> BotResult<Vec<Bar>> {
        #[derive(serde::Deserialize)]
        struct WireCandle {
            epoch: i64,
            open: f64,
            high: f64,
            low: f64,
            close: f64,
        }
        #[derive(serde::Deserialize)]
        struct CandleHistory {
            candles: Vec<WireCandle>,
        }

        let history: CandleHistory = self
            .typed_request(
                "get_candle_history",
                json!({
                    "method": "candle_history",
                    "params": {
                        "symbol": symbol,
                        "granularity": timeframe.duration_secs(),
                        "count": count,
                    },
                }),
            )
            .await?;

        Ok(history
            .candles
            .into_iter()
            .map(|c| Bar {
                symbol: symbol.to_string(),
                timeframe_secs: timeframe.duration_secs(),
                start_epoch: c.epoch,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
            })
            .collect())
    }

    async fn buy_contract(&self, order: &ContractOrder) -> BotResult<BuyResult> {
        self.typed_request(
            "buy_contract",
            json!({ "method": "buy", "params": order }),
        )
        .await
    }

    async fn sell_contract(&self, contract_id: &str, price: f64) -> BotResult<SellResult> {
        self.typed_request(
            "sell_contract",
            json!({ "method": "sell", "params": { "contract_id": contract_id, "price": price } }),
        )
        .await
    }

    async fn get_contract_info(&self, contract_id: &str) -> BotResult<ContractInfo> {
        self.typed_request(
            "get_contract_info",
            json!({ "method": "contract_info", "params": { "contract_id": contract_id } }),
        )
        .await
    }

    async fn get_balance(&self) -> BotResult<f64> {
        #[derive(serde::Deserialize)]
        struct Balance {
            balance: f64,
        }
        let b: Balance = self
            .typed_request("get_balance", json!({ "method": "balance", "params": {} }))
            .await?;
        Ok(b.balance)
    }

    async fn get_symbol_info(&self, symbol: &str) -> BotResult<SymbolInfo> {
        self.typed_request(
            "get_symbol_info",
            json!({ "method": "symbol_info", "params": { "symbol": symbol } }),
        )
        .await
    }
}
