// ===============================
// src/ingress.rs (HTTP: webhook + query + metrics)
// ===============================
//
// Routes:
//   POST /orders            body = signal JSON -> {success, message}
//   POST /orders/cancel     {symbol, orderId?, category?, sandbox?}
//   GET  /positions         ?symbol=SOLUSDT&sandbox=true&category=linear
//   GET  /metrics           Prometheus text
//   GET  /health
//
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::domain::{Environment, ExecResult, SignalPayload, DEFAULT_CATEGORY};
use crate::error::ExecError;
use crate::exchange::{AccountReader, OrderExecutor};
use crate::intake::OrderIntake;
use crate::metrics::encode_metrics;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    symbol: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    sandbox: Option<bool>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    resp
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json_response(status, &ExecResult::failed(message))
}

fn status_for(e: &ExecError) -> StatusCode {
    match e {
        ExecError::InvalidSignal(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| failure(StatusCode::BAD_REQUEST, format!("unreadable body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| failure(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")))
}

async fn post_order(intake: &OrderIntake, req: Request<Body>) -> Response<Body> {
    let payload: SignalPayload = match read_json(req).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match intake.receive_order(payload).await {
        Ok(res) => json_response(StatusCode::OK, &res),
        Err(e) => failure(status_for(&e), e.to_string()),
    }
}

async fn cancel_orders(intake: &OrderIntake, req: Request<Body>) -> Response<Body> {
    let body: CancelBody = match read_json(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let env = Environment::from_sandbox_flag(body.sandbox.unwrap_or(true));
    let reconciler = match intake.routes().get(env) {
        Ok(r) => r,
        Err(e) => return failure(status_for(&e), e.to_string()),
    };
    let category = body.category.as_deref().unwrap_or(DEFAULT_CATEGORY);
    let symbol = crate::domain::normalize_symbol(&body.symbol);
    let ex = reconciler.exchange();
    let result = match body.order_id.as_deref() {
        Some(id) => ex.cancel_order(category, &symbol, id).await,
        None => ex.cancel_all_orders(category, &symbol).await,
    };
    match result {
        Ok(()) => {
            info!(%symbol, order_id = ?body.order_id, %env, "cancel requested via http");
            json_response(StatusCode::OK, &ExecResult::ok("Cancel request accepted"))
        }
        Err(e) => failure(status_for(&e), e.to_string()),
    }
}

async fn get_positions(intake: &OrderIntake, req: &Request<Body>) -> Response<Body> {
    let q = query_params(req);
    let Some(symbol) = q.get("symbol").map(|s| crate::domain::normalize_symbol(s)) else {
        return failure(StatusCode::BAD_REQUEST, "symbol is required");
    };
    let sandbox = q.get("sandbox").map(|s| s != "false").unwrap_or(true);
    let category = q.get("category").map(String::as_str).unwrap_or(DEFAULT_CATEGORY);
    let reconciler = match intake.routes().get(Environment::from_sandbox_flag(sandbox)) {
        Ok(r) => r,
        Err(e) => return failure(status_for(&e), e.to_string()),
    };
    match reconciler.exchange().get_positions(category, &symbol).await {
        Ok(positions) => json_response(StatusCode::OK, &json!({ "success": true, "data": positions })),
        Err(e) => failure(status_for(&e), e.to_string()),
    }
}

/// Dispatch one request.
pub async fn route(intake: Arc<OrderIntake>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/orders") => post_order(&intake, req).await,
        (&Method::POST, "/orders/cancel") => cancel_orders(&intake, req).await,
        (&Method::GET, "/positions") => get_positions(&intake, &req).await,
        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Body::from(encode_metrics()));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "activeSymbols": intake.active_symbols() }),
        ),
        _ => failure(StatusCode::NOT_FOUND, "Not Found"),
    }
}

pub async fn serve(addr: SocketAddr, intake: Arc<OrderIntake>) -> Result<(), ExecError> {
    let make_svc = make_service_fn(move |_conn| {
        let intake = intake.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let intake = intake.clone();
                async move { Ok::<_, Infallible>(route(intake, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| ExecError::Transport(format!("bind {addr}: {e}")))?
        .serve(make_svc);
    info!(%addr, "http ingress listening");
    server.await.map_err(|e| {
        warn!(error = %e, "http server stopped");
        ExecError::Transport(e.to_string())
    })
}
