// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Intake --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_received_total", "signals accepted at intake (label: environment)"),
        &["environment"],
    )
    .unwrap()
});

pub static DUPLICATES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("signals_duplicate_total", "signals dropped because the symbol-side lock was held").unwrap()
});

pub static INTAKE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("intake_errors_total", "intake failures by error kind"), &["kind"]).unwrap()
});

// -------- Reconciliation --------
pub static OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reconcile_outcomes_total", "reconciliation outcomes (entered/closed/ignored/failed)"),
        &["outcome"],
    )
    .unwrap()
});

// Signal dequeued -> terminal branch (milliseconds)
pub static LAT_RECONCILE: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("reconcile_latency_ms", "Latency of one reconciliation (ms)")
            .buckets(vec![25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
    )
    .unwrap()
});

pub static SEQUENCER_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("sequencer_workers", "per-symbol workers currently alive").unwrap()
});

pub static STORE_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_store_errors_total", "failed order record writes").unwrap());

pub static NOTIFY_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("notify_errors_total", "failed outbound notifications").unwrap());

// -------- Exchange --------
pub static EXCHANGE_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("exchange_calls_total", "Bybit REST calls (labels: endpoint, result)"),
        &["endpoint", "result"],
    )
    .unwrap()
});

// -------- Private order stream health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("order_stream_ready", "1 if the private order stream is subscribed, 0 otherwise"),
        &["environment"],
    )
    .unwrap()
});

pub static WS_SESSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_stream_sessions_total", "Number of order stream sessions started"),
        &["environment"],
    )
    .unwrap()
});

pub static WS_LAST_EVENT_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("order_stream_last_event_ts", "Unix seconds of the last received order event"),
        &["environment"],
    )
    .unwrap()
});

pub static FILL_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("order_events_total", "order stream events by status"), &["status"]).unwrap()
});

pub static TRAILING_STOPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trailing_stops_total", "trailing stop placements (label: result)"),
        &["result"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_ACCOUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_account", "configured exchange accounts (labels: environment, mode)"),
        &["environment", "mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(DUPLICATES.clone())),
        REGISTRY.register(Box::new(INTAKE_ERRORS.clone())),
        REGISTRY.register(Box::new(OUTCOMES.clone())),
        REGISTRY.register(Box::new(LAT_RECONCILE.clone())),
        REGISTRY.register(Box::new(SEQUENCER_WORKERS.clone())),
        REGISTRY.register(Box::new(STORE_ERRORS.clone())),
        REGISTRY.register(Box::new(NOTIFY_ERRORS.clone())),
        REGISTRY.register(Box::new(EXCHANGE_CALLS.clone())),
        // Order stream health
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_SESSIONS.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(FILL_EVENTS.clone())),
        REGISTRY.register(Box::new(TRAILING_STOPS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_ACCOUNT.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_counters_show_up_in_text_output() {
        init();
        DUPLICATES.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("signals_duplicate_total"));
    }
}
