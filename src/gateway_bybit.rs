// ===============================
// src/gateway_bybit.rs
// ===============================
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::bybit::{
    decimal, decimal_or_zero, serialize_params, sign_request, timestamp_ms, ApiEnvelope, Method, Params,
};
use crate::domain::{
    Balance, LotSizeFilter, OpenOrder, OrderAck, OrderRequest, OrderStatus, Position, Side, Ticker,
    TrailingStopRequest,
};
use crate::error::ExecError;
use crate::exchange::{AccountReader, MarketData, OrderExecutor};
use crate::metrics::EXCHANGE_CALLS;

/// Bybit answers 110043 when leverage already equals the requested value.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Credentials + endpoint for one Bybit account.
#[derive(Clone, Debug)]
pub struct BybitCredentials {
    pub rest_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
}

/// Bybit v5 REST adapter. Every call is signed; nothing is cached.
pub struct BybitRest {
    http: reqwest::Client,
    creds: BybitCredentials,
}

impl BybitRest {
    pub fn new(http: reqwest::Client, creds: BybitCredentials) -> Self {
        Self { http, creds }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Params,
        endpoint: &'static str,
    ) -> Result<T, ExecError> {
        let res = self.call_raw(method, path, params).await;
        let label = match &res { Ok(_) => "ok", Err(e) => e.kind() };
        EXCHANGE_CALLS.with_label_values(&[endpoint, label]).inc();
        let result = res?;
        serde_json::from_value(result)
            .map_err(|e| ExecError::DataIntegrity(format!("{endpoint}: unexpected result shape: {e}")))
    }

    async fn call_raw(&self, method: Method, path: &str, params: Params) -> Result<Value, ExecError> {
        let ts = timestamp_ms();
        let payload = serialize_params(method, &params);
        let sig = sign_request(&self.creds.api_secret, ts, &self.creds.api_key, self.creds.recv_window, &payload);
        let base = self.creds.rest_url.trim_end_matches('/');

        let builder = match method {
            Method::Get if payload.is_empty() => self.http.get(format!("{base}{path}")),
            Method::Get => self.http.get(format!("{base}{path}?{payload}")),
            Method::Post => self.http.post(format!("{base}{path}")).body(payload.clone()),
        };

        debug!(%path, %payload, "bybit request");
        let rsp = builder
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("X-BAPI-RECV-WINDOW", self.creds.recv_window.to_string())
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| {
                error!(?e, %path, "bybit request failed");
                ExecError::Transport(format!("no response from Bybit API ({path}): {e}"))
            })?;

        let status = rsp.status();
        let body = rsp
            .text()
            .await
            .map_err(|e| ExecError::Transport(format!("reading Bybit response ({path}): {e}")))?;

        let envelope: ApiEnvelope = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(ExecError::Transport(format!("HTTP {status} from Bybit ({path}): {body}")));
            }
            Err(e) => return Err(ExecError::DataIntegrity(format!("{path}: malformed envelope: {e}"))),
        };

        if envelope.ret_code != 0 {
            error!(code = envelope.ret_code, msg = %envelope.ret_msg, %path, "bybit rejected request");
            return Err(ExecError::Exchange { code: envelope.ret_code, message: envelope.ret_msg });
        }
        Ok(envelope.result)
    }
}

fn params(v: Value) -> Params {
    match v {
        Value::Object(m) => m.into_iter().collect(),
        _ => Params::new(),
    }
}

// ---- Raw result shapes (only the fields we read) ----
#[derive(Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    leverage: String,
}

impl RawPosition {
    fn into_domain(self) -> Result<Position, ExecError> {
        Ok(Position {
            side: Side::parse(&self.side),
            size: decimal_or_zero("size", &self.size)?,
            avg_entry_price: decimal_or_zero("avgPrice", &self.avg_price)?,
            mark_price: decimal_or_zero("markPrice", &self.mark_price)?,
            unrealized_pnl: decimal_or_zero("unrealisedPnl", &self.unrealised_pnl)?,
            leverage: decimal("leverage", &self.leverage).ok(),
            symbol: self.symbol,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    order_id: String,
    symbol: String,
    #[serde(default)]
    side: String,
    order_status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWallet {
    #[serde(default)]
    total_equity: String,
    #[serde(default)]
    total_available_balance: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    last_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstrument {
    symbol: String,
    lot_size_filter: RawLotSize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLotSize {
    qty_step: String,
    min_order_qty: String,
    max_order_qty: String,
}

#[async_trait]
impl AccountReader for BybitRest {
    async fn get_positions(&self, category: &str, symbol: &str) -> Result<Vec<Position>, ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol }));
        let res: ListResult<RawPosition> = self.call(Method::Get, "/v5/position/list", p, "position_list").await?;
        res.list.into_iter().map(RawPosition::into_domain).collect()
    }

    async fn get_open_orders(&self, category: &str, symbol: &str) -> Result<Vec<OpenOrder>, ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol, "openOnly": 0 }));
        let res: ListResult<RawOrder> = self.call(Method::Get, "/v5/order/realtime", p, "order_realtime").await?;
        Ok(res
            .list
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.order_id,
                symbol: o.symbol,
                side: Side::parse(&o.side),
                status: OrderStatus::from(o.order_status),
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Balance, ExecError> {
        let p = params(json!({ "accountType": "UNIFIED" }));
        let res: ListResult<RawWallet> =
            self.call(Method::Get, "/v5/account/wallet-balance", p, "wallet_balance").await?;
        let wallet = res
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExecError::DataIntegrity("wallet-balance returned no account".into()))?;
        Ok(Balance {
            total_equity: decimal_or_zero("totalEquity", &wallet.total_equity)?,
            available: decimal_or_zero("totalAvailableBalance", &wallet.total_available_balance)?,
        })
    }
}

#[async_trait]
impl MarketData for BybitRest {
    async fn get_ticker(&self, category: &str, symbol: &str) -> Result<Ticker, ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol }));
        let res: ListResult<RawTicker> = self.call(Method::Get, "/v5/market/tickers", p, "tickers").await?;
        let t = res
            .list
            .into_iter()
            .find(|t| t.symbol == symbol)
            .ok_or_else(|| ExecError::DataIntegrity(format!("no ticker for {symbol}")))?;
        Ok(Ticker { last_price: decimal("lastPrice", &t.last_price)?, symbol: t.symbol })
    }

    async fn get_instrument(&self, category: &str, symbol: &str) -> Result<LotSizeFilter, ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol }));
        let res: ListResult<RawInstrument> =
            self.call(Method::Get, "/v5/market/instruments-info", p, "instruments_info").await?;
        let ins = res
            .list
            .into_iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| ExecError::DataIntegrity(format!("no instrument info for {symbol}")))?;
        Ok(LotSizeFilter {
            qty_step: decimal("qtyStep", &ins.lot_size_filter.qty_step)?,
            min_order_qty: decimal("minOrderQty", &ins.lot_size_filter.min_order_qty)?,
            max_order_qty: decimal("maxOrderQty", &ins.lot_size_filter.max_order_qty)?,
        })
    }
}

#[async_trait]
impl OrderExecutor for BybitRest {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExecError> {
        // positionIdx 0 = one-way mode
        let p = params(json!({
            "category": req.category,
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "orderType": req.order_type,
            "qty": req.qty.normalize().to_string(),
            "positionIdx": 0,
            "reduceOnly": req.reduce_only,
            "orderLinkId": req.order_link_id,
        }));
        self.call(Method::Post, "/v5/order/create", p, "order_create").await
    }

    async fn cancel_order(&self, category: &str, symbol: &str, order_id: &str) -> Result<(), ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol, "orderId": order_id }));
        let _: Value = self.call(Method::Post, "/v5/order/cancel", p, "order_cancel").await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, category: &str, symbol: &str) -> Result<(), ExecError> {
        let p = params(json!({ "category": category, "symbol": symbol }));
        let _: Value = self.call(Method::Post, "/v5/order/cancel-all", p, "order_cancel_all").await?;
        Ok(())
    }

    async fn set_leverage(&self, category: &str, symbol: &str, leverage: u32) -> Result<(), ExecError> {
        let lev = leverage.to_string();
        let p = params(json!({
            "category": category,
            "symbol": symbol,
            "buyLeverage": lev,
            "sellLeverage": lev,
        }));
        match self.call::<Value>(Method::Post, "/v5/position/set-leverage", p, "set_leverage").await {
            Ok(_) => Ok(()),
            Err(ExecError::Exchange { code: LEVERAGE_NOT_MODIFIED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_trailing_stop(&self, req: &TrailingStopRequest) -> Result<(), ExecError> {
        let p = params(json!({
            "category": req.category,
            "symbol": req.symbol,
            "trailingStop": req.trailing_stop.normalize().to_string(),
            "tpslMode": "Full",
            "positionIdx": req.position_idx,
        }));
        let _: Value = self.call(Method::Post, "/v5/position/trading-stop", p, "trading_stop").await?;
        Ok(())
    }
}
