// ===============================
// src/fill_watcher.rs (private order stream)
// ===============================
//
// Satu sesi = connect -> auth -> subscribe "order" -> Ready -> terima event.
// Sesi berakhir saat error/close: state kembali Disconnected dan ada notifikasi.
// Reconnect BUKAN urusan modul ini; supervisor di main.rs yang memutuskan.
//
// Readiness lewat `watch` channel, jadi bisa ditunggu ulang setelah reconnect.
// Tiap event order dijalankan di task sendiri supaya loop baca + ping tidak
// ikut tertahan saat menunggu posisi muncul.
//
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{
    order_events, timestamp_ms, ws_auth_frame, ws_ping_frame, ws_subscribe_frame, WsFrame, ORDER_TOPIC,
    WS_AUTH_TTL_MS,
};
use crate::domain::{
    Environment, FillEvent, JournalEvent, OrderStatus, Position, Side, TrailingStopRequest, NO_ERROR_REJECT_REASON,
};
use crate::error::ExecError;
use crate::exchange::{AccountReader, Exchange, OrderExecutor};
use crate::metrics::{FILL_EVENTS, TRAILING_STOPS, WS_CONNECTED, WS_LAST_EVENT_TS, WS_SESSIONS};
use crate::notify::{notify_quietly, Notification, Notifier};
use crate::recorder::Journal;
use crate::retry::{poll_until, Backoff};

const PING_EVERY: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    AuthOk,
    AuthFailed(String),
    Subscribed,
    SubscribeFailed(String),
    Orders(Vec<FillEvent>),
    Pong,
    Ignore,
}

/// Classify one inbound text frame.
pub fn classify_frame(text: &str) -> Result<FrameAction, ExecError> {
    let frame: WsFrame =
        serde_json::from_str(text).map_err(|e| ExecError::DataIntegrity(format!("stream frame: {e}")))?;

    if let Some(topic) = frame.topic.as_deref() {
        if topic == ORDER_TOPIC || topic.starts_with("order.") {
            let data = frame.data.unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
            return Ok(FrameAction::Orders(order_events(data)?));
        }
        return Ok(FrameAction::Ignore);
    }

    let ok = frame.success.unwrap_or(false);
    let msg = frame.ret_msg.unwrap_or_default();
    Ok(match frame.op.as_deref() {
        Some("auth") if ok => FrameAction::AuthOk,
        Some("auth") => FrameAction::AuthFailed(msg),
        Some("subscribe") if ok => FrameAction::Subscribed,
        Some("subscribe") => FrameAction::SubscribeFailed(msg),
        Some("pong") | Some("ping") => FrameAction::Pong,
        _ => FrameAction::Ignore,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillAction {
    /// Non-terminal status.
    Ignored,
    /// Terminal status, notified, nothing else to do.
    Notified,
    TrailingStopSet,
    TrailingStopFailed,
    PositionNotFound,
}

#[derive(Debug, Clone)]
pub struct StreamCredentials {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Per-event work, shared by every spawned event task.
struct FillHandler {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    environment: Environment,
    trailing_distance: Decimal,
    backoff: Backoff,
}

pub struct FillWatcher {
    handler: Arc<FillHandler>,
    notifier: Arc<dyn Notifier>,
    environment: Environment,
    creds: StreamCredentials,
    state: watch::Sender<StreamState>,
}

impl FillWatcher {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
        environment: Environment,
        creds: StreamCredentials,
        trailing_distance: Decimal,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        let handler = FillHandler {
            exchange,
            notifier: notifier.clone(),
            journal,
            environment,
            trailing_distance,
            backoff: Backoff { max_attempts: 6, ..Backoff::default() },
        };
        Self { handler: Arc::new(handler), notifier, environment, creds, state }
    }

    /// Builder step; no effect once events have been dispatched.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        if let Some(h) = Arc::get_mut(&mut self.handler) {
            h.backoff = backoff;
        }
        self
    }

    pub fn state(&self) -> StreamState { *self.state.borrow() }

    /// Resolves once the current session reaches Ready. Reusable across reconnects.
    pub async fn wait_ready(&self) -> Result<(), ExecError> {
        let mut rx = self.state.subscribe();
        rx.wait_for(|s| *s == StreamState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| ExecError::Stream("watcher dropped".into()))
    }

    fn set_state(&self, s: StreamState) {
        debug!(env = %self.environment, state = ?s, "order stream state");
        self.state.send_replace(s);
        WS_CONNECTED
            .with_label_values(&[self.environment.as_str()])
            .set(i64::from(s == StreamState::Ready));
    }

    /// One connection lifetime. Always ends Disconnected, with a notification.
    pub async fn run_session(&self) -> Result<(), ExecError> {
        WS_SESSIONS.with_label_values(&[self.environment.as_str()]).inc();
        let result = self.session().await;
        self.set_state(StreamState::Disconnected);

        let reason = match &result {
            Ok(()) => "closed by remote".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(env = %self.environment, %reason, "order stream disconnected");
        let n = Notification {
            error: Some(reason),
            ..Notification::titled(format!("🔌 {} Order Stream Disconnected.", self.environment))
        };
        notify_quietly(self.notifier.as_ref(), &n).await;
        result
    }

    async fn session(&self) -> Result<(), ExecError> {
        self.set_state(StreamState::Connecting);
        let url = Url::parse(&self.creds.ws_url)
            .map_err(|e| ExecError::Stream(format!("bad ws url {}: {e}", self.creds.ws_url)))?;
        info!(%url, env = %self.environment, "connecting order stream");
        let (ws, _resp) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        self.set_state(StreamState::Authenticating);
        let expires = timestamp_ms() + WS_AUTH_TTL_MS;
        write
            .send(Message::Text(ws_auth_frame(&self.creds.api_key, &self.creds.api_secret, expires)))
            .await?;

        let mut ping = interval(PING_EVERY);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = read.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    match frame? {
                        Message::Text(txt) => match classify_frame(&txt) {
                            Ok(FrameAction::AuthOk) => {
                                self.set_state(StreamState::Subscribing);
                                write.send(Message::Text(ws_subscribe_frame(&[ORDER_TOPIC]))).await?;
                            }
                            Ok(FrameAction::AuthFailed(msg)) => {
                                return Err(ExecError::Stream(format!("auth rejected: {msg}")));
                            }
                            Ok(FrameAction::Subscribed) => {
                                self.set_state(StreamState::Ready);
                                info!(env = %self.environment, "order stream ready");
                            }
                            Ok(FrameAction::SubscribeFailed(msg)) => {
                                return Err(ExecError::Stream(format!("subscribe rejected: {msg}")));
                            }
                            Ok(FrameAction::Orders(events)) => {
                                for ev in events {
                                    self.dispatch(ev);
                                }
                            }
                            Ok(FrameAction::Pong) | Ok(FrameAction::Ignore) => {}
                            Err(e) => warn!(error = %e, "unreadable stream frame, skipped"),
                        },
                        Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Text(ws_ping_frame())).await?;
                }
            }
        }
    }

    /// Handles one order event on its own task.
    pub fn dispatch(&self, ev: FillEvent) -> JoinHandle<FillAction> {
        let handler = self.handler.clone();
        tokio::spawn(async move { handler.handle(&ev).await })
    }
}

impl FillHandler {
    async fn open_position(&self, category: &str, symbol: &str, side: Side) -> Result<Option<Position>, ExecError> {
        let positions = self.exchange.get_positions(category, symbol).await?;
        Ok(positions.into_iter().find(|p| p.is_open() && p.side == Some(side)))
    }

    /// Terminal statuses are notified; a clean entry fill gets a trailing stop.
    async fn handle(&self, ev: &FillEvent) -> FillAction {
        let status: String = ev.order_status.clone().into();
        FILL_EVENTS.with_label_values(&[status.as_str()]).inc();
        WS_LAST_EVENT_TS
            .with_label_values(&[self.environment.as_str()])
            .set(Utc::now().timestamp());
        self.journal.record(JournalEvent::Fill(ev.clone()));

        if !ev.order_status.is_terminal() {
            return FillAction::Ignored;
        }

        let emoji = match ev.order_status {
            OrderStatus::Filled => "🎯",
            _ => "🚫",
        };
        let rejected = !ev.reject_reason.is_empty() && ev.reject_reason != NO_ERROR_REJECT_REASON;
        let n = Notification {
            symbol: Some(ev.symbol.clone()),
            side: ev.side.map(|s| s.to_string()),
            qty: ev.qty.map(|q| q.to_string()),
            entry_price: ev.avg_price.map(|p| p.to_string()),
            reject_reason: rejected.then(|| ev.reject_reason.clone()),
            ..Notification::titled(format!("{emoji} {} Order {status}.", self.environment))
        };
        notify_quietly(self.notifier.as_ref(), &n).await;

        let side = match ev.side {
            Some(s) if ev.order_status == OrderStatus::Filled && !rejected && !ev.reduce_only => s,
            _ => return FillAction::Notified,
        };

        let (category, symbol) = (ev.category.as_str(), ev.symbol.as_str());
        let position = match poll_until(&self.backoff, move || self.open_position(category, symbol, side)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(%symbol, %side, error = %e, "filled but no matching position, trailing stop skipped");
                let n = Notification {
                    symbol: Some(ev.symbol.clone()),
                    side: Some(side.to_string()),
                    error: Some(e.to_string()),
                    ..Notification::titled(format!("⚠️ {} Trailing Stop Skipped.", self.environment))
                };
                notify_quietly(self.notifier.as_ref(), &n).await;
                return FillAction::PositionNotFound;
            }
        };

        let req = TrailingStopRequest {
            category: ev.category.clone(),
            symbol: ev.symbol.clone(),
            trailing_stop: self.trailing_distance,
            position_idx: 0,
        };
        match self.exchange.set_trailing_stop(&req).await {
            Ok(()) => {
                TRAILING_STOPS.with_label_values(&["ok"]).inc();
                info!(%symbol, %side, distance = %self.trailing_distance, "trailing stop set");
                let n = Notification {
                    symbol: Some(ev.symbol.clone()),
                    side: Some(side.to_string()),
                    qty: Some(position.size.to_string()),
                    entry_price: Some(position.avg_entry_price.to_string()),
                    ..Notification::titled(format!(
                        "🛡️ {} Trailing Stop Set ({}).",
                        self.environment, self.trailing_distance
                    ))
                };
                notify_quietly(self.notifier.as_ref(), &n).await;
                FillAction::TrailingStopSet
            }
            Err(e) => {
                TRAILING_STOPS.with_label_values(&[e.kind()]).inc();
                error!(%symbol, error = %e, "trailing stop failed");
                let n = Notification {
                    symbol: Some(ev.symbol.clone()),
                    side: Some(side.to_string()),
                    error: Some(e.to_string()),
                    ..Notification::titled(format!("❌ {} Trailing Stop Failed.", self.environment))
                };
                notify_quietly(self.notifier.as_ref(), &n).await;
                FillAction::TrailingStopFailed
            }
        }
    }
}
