// ===============================
// src/domain.rs
// ===============================
use std::{fmt, str::FromStr};

use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }

    /// Case-insensitive; Bybit returns "" or "None" for a flat position.
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment { Sandbox, Production }

impl Environment {
    pub fn from_sandbox_flag(sandbox: bool) -> Self {
        if sandbox { Environment::Sandbox } else { Environment::Production }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Environment::Sandbox => "Sandbox", Environment::Production => "Production" }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Raw webhook body, as TradingView-style alerts send it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub qty: Option<Value>,
    #[serde(default)]
    pub leverage: Option<Value>,
    #[serde(default)]
    pub sandbox: Option<Value>,
}

/// Product category used when a signal or stream event does not name one.
pub const DEFAULT_CATEGORY: &str = "linear";

/// Highest leverage Bybit offers on any contract.
pub const MAX_LEVERAGE: u32 = 200;

/// Accepted, normalized signal. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub category: String,
    pub order_type: String,
    pub qty: Decimal,
    pub leverage: Option<u32>,
    pub sandbox: bool,
}

impl Signal {
    pub fn environment(&self) -> Environment { Environment::from_sandbox_flag(self.sandbox) }
}

/// "SOLUSDT.P" -> "SOLUSDT"
pub fn normalize_symbol(raw: &str) -> String {
    let up = raw.trim().to_ascii_uppercase();
    match up.strip_suffix(".P") {
        Some(s) => s.to_string(),
        None => up,
    }
}

fn value_to_decimal(field: &str, v: &Value) -> Result<Decimal, ExecError> {
    let raw = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(ExecError::InvalidSignal(format!("{field} must be a number, got {other}"))),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| ExecError::InvalidSignal(format!("{field} is not a valid number: {raw:?}")))
}

fn value_to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|x| x != 0),
        _ => None,
    }
}

impl TryFrom<SignalPayload> for Signal {
    type Error = ExecError;

    fn try_from(p: SignalPayload) -> Result<Self, Self::Error> {
        let symbol = p
            .symbol
            .as_deref()
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExecError::InvalidSignal("symbol is required".into()))?;
        let side_raw = p.side.ok_or_else(|| ExecError::InvalidSignal("side is required".into()))?;
        let side = Side::parse(&side_raw)
            .ok_or_else(|| ExecError::InvalidSignal(format!("unknown side {side_raw:?}")))?;
        let qty = match &p.qty {
            Some(v) => value_to_decimal("qty", v)?,
            None => return Err(ExecError::InvalidSignal("qty is required".into())),
        };
        if qty.is_sign_negative() {
            return Err(ExecError::InvalidSignal("qty must not be negative".into()));
        }
        let leverage = match &p.leverage {
            None | Some(Value::Null) => None,
            Some(v) => {
                let lev = value_to_decimal("leverage", v)?;
                let whole = lev
                    .to_u32()
                    .filter(|l| (1..=MAX_LEVERAGE).contains(l) && lev.fract().is_zero())
                    .ok_or_else(|| ExecError::InvalidSignal(format!("leverage out of range: {lev}")))?;
                Some(whole)
            }
        };
        let sandbox = match &p.sandbox {
            None | Some(Value::Null) => true,
            Some(v) => value_to_bool(v)
                .ok_or_else(|| ExecError::InvalidSignal(format!("sandbox flag not understood: {v}")))?,
        };

        Ok(Signal {
            symbol,
            side,
            category: p.category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            order_type: p.order_type.unwrap_or_else(|| "Market".to_string()),
            qty,
            leverage,
            sandbox,
        })
    }
}

/// Live position snapshot, never cached across reconciliations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub side: Option<Side>,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Option<Decimal>,
}

impl Position {
    pub fn is_open(&self) -> bool { self.side.is_some() && self.size > Decimal::ZERO }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub total_equity: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
}

/// Lot size rules for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotSizeFilter {
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
    pub max_order_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Created,
    New,
    Processing,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Other(String),
}

impl OrderStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::New | OrderStatus::Processing)
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

impl From<String> for OrderStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Created" => OrderStatus::Created,
            "New" => OrderStatus::New,
            "Processing" => OrderStatus::Processing,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Other(s),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(s: OrderStatus) -> Self {
        match s {
            OrderStatus::Created => "Created".into(),
            OrderStatus::New => "New".into(),
            OrderStatus::Processing => "Processing".into(),
            OrderStatus::PartiallyFilled => "PartiallyFilled".into(),
            OrderStatus::Filled => "Filled".into(),
            OrderStatus::Cancelled => "Cancelled".into(),
            OrderStatus::Rejected => "Rejected".into(),
            OrderStatus::Other(o) => o,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Option<Side>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub category: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub qty: Decimal,
    pub reduce_only: bool,
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailingStopRequest {
    pub category: String,
    pub symbol: String,
    pub trailing_stop: Decimal,
    pub position_idx: u8,
}

// ---- Persisted order history ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action { Entry, Exit }

impl Action {
    pub fn as_str(&self) -> &'static str { match self { Action::Entry => "entry", Action::Exit => "exit" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus { Entered, Closed, Ignored, Failed }

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Entered => "entered",
            OutcomeStatus::Closed => "closed",
            OutcomeStatus::Ignored => "ignored",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Row written at intake, before anything touches the exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrderRecord {
    pub symbol: String,
    pub side: Side,
    pub category: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub environment: Environment,
    pub leverage: Option<u32>,
}

impl From<&Signal> for NewOrderRecord {
    fn from(s: &Signal) -> Self {
        NewOrderRecord {
            symbol: s.symbol.clone(),
            side: s.side,
            category: s.category.clone(),
            order_type: s.order_type.clone(),
            quantity: s.qty,
            environment: s.environment(),
            leverage: s.leverage,
        }
    }
}

/// Outcome fields written once per execution path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderOutcome {
    pub status: OutcomeStatus,
    pub action: Option<Action>,
    pub quantity: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub leverage: Option<u32>,
    pub execution_time_seconds: f64,
    pub message: String,
}

impl OrderOutcome {
    pub fn ignored(message: impl Into<String>, execution_time_seconds: f64) -> Self {
        Self::bare(OutcomeStatus::Ignored, message, execution_time_seconds)
    }

    pub fn failed(message: impl Into<String>, execution_time_seconds: f64) -> Self {
        Self::bare(OutcomeStatus::Failed, message, execution_time_seconds)
    }

    fn bare(status: OutcomeStatus, message: impl Into<String>, execution_time_seconds: f64) -> Self {
        OrderOutcome {
            status,
            action: None,
            quantity: None,
            entry_price: None,
            exit_price: None,
            realized_pnl: None,
            leverage: None,
            execution_time_seconds,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub id: i64,
    pub order: NewOrderRecord,
    pub outcome: Option<OrderOutcome>,
}

/// One order update from the private stream. Transient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillEvent {
    pub category: String,
    pub symbol: String,
    pub order_id: String,
    pub side: Option<Side>,
    pub order_status: OrderStatus,
    pub reject_reason: String,
    pub reduce_only: bool,
    pub avg_price: Option<Decimal>,
    pub qty: Option<Decimal>,
}

/// Bybit's marker for "no rejection".
pub const NO_ERROR_REJECT_REASON: &str = "EC_NoError";

/// `{success, message}` as returned to webhook callers and by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    pub message: String,
}

impl ExecResult {
    pub fn ok(message: impl Into<String>) -> Self { Self { success: true, message: message.into() } }
    pub fn failed(message: impl Into<String>) -> Self { Self { success: false, message: message.into() } }
}

/// Journal lines (see recorder.rs).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    Intake { record_id: i64, signal: Signal },
    Outcome { record_id: i64, symbol: String, outcome: OrderOutcome },
    Fill(FillEvent),
    Note { message: String },
}
