// ===============================
// src/bybit.rs
// ===============================
//
// Helper Bybit v5: signer + wire models (REST envelope & private stream frames).
//
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::domain::{FillEvent, OrderStatus, Side, DEFAULT_CATEGORY};
use crate::error::ExecError;

/// Default `X-BAPI-RECV-WINDOW`; requests older than this are refused by Bybit.
pub const RECV_WINDOW_MS: u64 = 10_000;

/// Private stream auth signatures expire after this long.
pub const WS_AUTH_TTL_MS: u64 = 10 * 60 * 1000;

pub const ORDER_TOPIC: &str = "order";

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Params are kept in a BTreeMap so both encodings come out key-sorted.
pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method { Get, Post }

fn query_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// GET -> `a=1&b=2`, POST -> compact JSON body. Null params are dropped.
pub fn serialize_params(method: Method, params: &Params) -> String {
    let clean: BTreeMap<&String, &Value> = params.iter().filter(|(_, v)| !v.is_null()).collect();
    match method {
        Method::Get => clean
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(&query_value(v))))
            .collect::<Vec<_>>()
            .join("&"),
        Method::Post => serde_json::to_string(&clean).unwrap_or_else(|_| "{}".to_string()),
    }
}

/// HMAC-SHA256 over `timestamp + apiKey + recvWindow + payload`.
pub fn sign_request(secret: &str, timestamp: u64, api_key: &str, recv_window: u64, payload: &str) -> String {
    sign(secret, &format!("{timestamp}{api_key}{recv_window}{payload}"))
}

/// `{"op":"auth","args":[apiKey, expires, signature]}`
pub fn ws_auth_frame(api_key: &str, secret: &str, expires: u64) -> String {
    let signature = sign(secret, &format!("GET/realtime{expires}"));
    serde_json::json!({ "op": "auth", "args": [api_key, expires, signature] }).to_string()
}

pub fn ws_subscribe_frame(topics: &[&str]) -> String {
    serde_json::json!({ "op": "subscribe", "args": topics }).to_string()
}

pub fn ws_ping_frame() -> String {
    serde_json::json!({ "op": "ping" }).to_string()
}

// ---- REST envelope ----
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Value,
}

/// `""` dari Bybit dianggap nol (posisi flat, avgPrice kosong, dst).
pub fn decimal_or_zero(field: &str, raw: &str) -> Result<Decimal, ExecError> {
    if raw.trim().is_empty() {
        return Ok(Decimal::ZERO);
    }
    decimal(field, raw)
}

pub fn decimal(field: &str, raw: &str) -> Result<Decimal, ExecError> {
    Decimal::from_str(raw.trim())
        .map_err(|_| ExecError::DataIntegrity(format!("field {field} is not a decimal: {raw:?}")))
}

// ---- Private stream frames ----
/// Private stream control frames use snake_case (`ret_msg`, `conn_id`).
#[derive(Debug, Deserialize)]
pub struct WsFrame {
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrder {
    #[serde(default)]
    pub category: String,
    pub symbol: String,
    pub order_status: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub cum_exec_qty: String,
}

impl WsOrder {
    pub fn into_fill_event(self) -> FillEvent {
        let avg_price = decimal("avgPrice", &self.avg_price).ok().filter(|p| !p.is_zero());
        let qty = decimal("cumExecQty", &self.cum_exec_qty).ok();
        let category = if self.category.is_empty() { DEFAULT_CATEGORY.to_string() } else { self.category };
        FillEvent {
            category,
            side: Side::parse(&self.side),
            order_status: OrderStatus::from(self.order_status),
            symbol: self.symbol,
            order_id: self.order_id,
            reject_reason: self.reject_reason,
            reduce_only: self.reduce_only,
            avg_price,
            qty,
        }
    }
}

/// Order events carried by one `order*` topic frame.
pub fn order_events(data: Value) -> Result<Vec<FillEvent>, ExecError> {
    let orders: Vec<WsOrder> = serde_json::from_value(data)
        .map_err(|e| ExecError::DataIntegrity(format!("order frame: {e}")))?;
    Ok(orders.into_iter().map(WsOrder::into_fill_event).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Params {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn get_params_are_sorted_and_urlencoded() {
        let p = params(json!({"symbol": "SOLUSDT", "category": "linear", "openOnly": 0, "cursor": null}));
        assert_eq!(serialize_params(Method::Get, &p), "category=linear&openOnly=0&symbol=SOLUSDT");
    }

    #[test]
    fn post_params_are_sorted_json() {
        let p = params(json!({"symbol": "SOLUSDT", "category": "linear", "reduceOnly": true}));
        assert_eq!(
            serialize_params(Method::Post, &p),
            r#"{"category":"linear","reduceOnly":true,"symbol":"SOLUSDT"}"#
        );
    }

    #[test]
    fn signature_covers_timestamp_key_window_and_payload() {
        let payload = "category=linear&symbol=SOLUSDT";
        let sig = sign_request("secret", 1_700_000_000_000, "key", 10_000, payload);
        assert_eq!(sig, sign("secret", "1700000000000key10000category=linear&symbol=SOLUSDT"));
        assert_eq!(sig.len(), 64);
        assert_ne!(sig, sign_request("secret", 1_700_000_000_001, "key", 10_000, payload));
    }

    #[test]
    fn ws_auth_frame_signs_realtime_challenge() {
        let frame: Value = serde_json::from_str(&ws_auth_frame("key", "secret", 42)).unwrap();
        assert_eq!(frame["op"], "auth");
        assert_eq!(frame["args"][0], "key");
        assert_eq!(frame["args"][1], 42);
        assert_eq!(frame["args"][2], sign("secret", "GET/realtime42"));
    }

    #[test]
    fn order_frame_maps_to_fill_events() {
        let events = order_events(json!([{
            "symbol": "SOLUSDT",
            "orderId": "abc",
            "side": "Sell",
            "orderStatus": "Filled",
            "rejectReason": "EC_NoError",
            "avgPrice": "151.2",
            "cumExecQty": "0.7",
            "reduceOnly": false
        }]))
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_status, OrderStatus::Filled);
        assert_eq!(events[0].side, Some(Side::Sell));
        assert_eq!(events[0].avg_price, Some(Decimal::from_str("151.2").unwrap()));
        assert_eq!(events[0].category, "linear");

        let inverse = order_events(json!([{
            "category": "inverse", "symbol": "BTCUSD", "side": "Buy", "orderStatus": "Filled"
        }]))
        .unwrap();
        assert_eq!(inverse[0].category, "inverse");
    }

    #[test]
    fn empty_decimal_field_is_zero_but_garbage_is_an_error() {
        assert_eq!(decimal_or_zero("size", "").unwrap(), Decimal::ZERO);
        assert!(matches!(decimal("size", "abc"), Err(ExecError::DataIntegrity(_))));
    }
}
