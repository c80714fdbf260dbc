// ===============================
// src/notify.rs (outbound notifications)
// ===============================
//
// Notifikasi ke Telegram (MarkdownV2). Gagal kirim tidak boleh menggagalkan
// eksekusi: pemanggil cukup log + metric, lihat `notify_quietly`.
//
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::metrics::NOTIFY_ERRORS;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

/// All fields optional except the title; absent ones are left out of the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub category: Option<String>,
    pub closing_side: Option<String>,
    pub order_type: Option<String>,
    pub qty: Option<String>,
    pub entry_price: Option<String>,
    pub exit_price: Option<String>,
    pub pnl: Option<String>,
    pub leverage: Option<String>,
    pub execution_time: Option<String>,
    pub error: Option<String>,
    pub reject_reason: Option<String>,
}

impl Notification {
    pub fn titled(title: impl Into<String>) -> Self {
        Self { title: title.into(), ..Default::default() }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, n: &Notification) -> Result<(), ExecError>;
}

/// Send and swallow the error.
pub async fn notify_quietly(notifier: &dyn Notifier, n: &Notification) {
    if let Err(e) = notifier.send(n).await {
        NOTIFY_ERRORS.inc();
        warn!(title = %n.title, error = %e, "notification failed");
    }
}

/// Escape every MarkdownV2 reserved character.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if "_*[]()~`>#+-=|{}.!".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn format_markdown_v2(n: &Notification) -> String {
    let mut msg = format!("*{}*\n\n", escape_markdown_v2(&n.title));
    let fields = [
        ("Symbol", &n.symbol),
        ("Side", &n.side),
        ("Category", &n.category),
        ("Closed Side", &n.closing_side),
        ("Order Type", &n.order_type),
        ("Quantity", &n.qty),
        ("Entry Price", &n.entry_price),
        ("Exit Price", &n.exit_price),
        ("PnL", &n.pnl),
        ("Leverage", &n.leverage),
        ("Execution Time", &n.execution_time),
        ("Error", &n.error),
        ("Reject Reason", &n.reject_reason),
    ];
    for (label, value) in fields {
        if let Some(v) = value {
            msg.push_str(&format!("*{}*: `{}`\n", escape_markdown_v2(label), escape_markdown_v2(v)));
        }
    }
    msg
}

pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, n: &Notification) -> Result<(), ExecError> {
        let url = format!("{}{}/sendMessage", self.base_url, self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": format_markdown_v2(n),
            "parse_mode": "MarkdownV2",
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecError::Notify(format!("telegram unreachable: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExecError::Notify(format!("telegram HTTP {status}: {text}")));
        }
        debug!(title = %n.title, "telegram sent");
        Ok(())
    }
}

/// Fallback when no chat is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<(), ExecError> {
        info!(
            title = %n.title,
            symbol = n.symbol.as_deref().unwrap_or("-"),
            side = n.side.as_deref().unwrap_or("-"),
            error = n.error.as_deref().unwrap_or(""),
            "notification"
        );
        Ok(())
    }
}
