// ===============================
// src/main.rs
// ===============================
/*
 # kirim sinyal (format alert TradingView)
curl -s -XPOST localhost:8080/orders -d '{"category":"linear","symbol":"SOLUSDT.P","side":"Sell","orderType":"Market","qty":"0.7","sandbox":"true"}'

# posisi live & kesehatan stream
curl -s 'localhost:8080/positions?symbol=SOLUSDT&sandbox=true'
curl -s localhost:8080/metrics | egrep '^(order_stream_ready|reconcile_outcomes_total|signals_duplicate_total)'

*/
/*
=============================================================================
Project : signal_exec_bot — signal-to-order execution core for Bybit v5
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Receives TradingView-style webhook signals, deduplicates them with
          a symbol-side lock, serializes execution per symbol, reconciles
          against live positions, clamps size to margin and lot rules,
          watches the private order stream to place trailing stops,
          exposes Prometheus metrics, and records JSONL events.
=============================================================================
*/
mod bybit;          // signer + wire models Bybit v5
mod config;
mod domain;
mod error;
mod exchange;       // capability traits (+ mock untuk test)
mod fill_watcher;   // private order stream -> trailing stop
mod gateway_bybit;  // REST adapter
mod ingress;        // hyper: /orders, /positions, /metrics
mod intake;
mod lock;
mod metrics;
mod notify;
mod quantity;
mod reconcile;
mod recorder;
mod retry;
mod sequencer;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::{
    select,
    sync::mpsc,
    time::{sleep, timeout, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Account, Args};
use crate::domain::{Environment, JournalEvent};
use crate::error::ExecError;
use crate::exchange::Exchange;
use crate::fill_watcher::{FillWatcher, StreamCredentials};
use crate::gateway_bybit::{BybitCredentials, BybitRest};
use crate::intake::{OrderIntake, Routes};
use crate::lock::{LockStore, MemoryLockStore, RedisLockStore};
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::reconcile::Reconciler;
use crate::recorder::Journal;
use crate::sequencer::Sequencer;
use crate::store::{MemoryOrderStore, OrderStore, PgOrderStore};

/// Jeda sebelum supervisor membuka sesi order stream baru.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
/// Berapa lama startup menunggu stream Ready sebelum membuka ingress.
const READY_WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();

    if let Err(e) = run(args).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

/// Satu akun: adapter REST + reconciler + fill watcher
struct Venue {
    reconciler: Arc<Reconciler>,
    watcher: Arc<FillWatcher>,
}

fn build_venue(
    env: Environment,
    account: &Account,
    args: &Args,
    http: &reqwest::Client,
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
) -> Venue {
    let exchange: Arc<dyn Exchange> = Arc::new(BybitRest::new(
        http.clone(),
        BybitCredentials {
            rest_url: account.rest_url.clone(),
            api_key: account.api_key.clone(),
            api_secret: account.api_secret.clone(),
            recv_window: args.recv_window_ms,
        },
    ));
    let reconciler = Arc::new(Reconciler::new(
        exchange.clone(),
        store,
        notifier.clone(),
        journal.clone(),
        env,
        args.default_leverage,
    ));
    let watcher = Arc::new(FillWatcher::new(
        exchange,
        notifier,
        journal,
        env,
        StreamCredentials {
            ws_url: account.ws_url.clone(),
            api_key: account.api_key.clone(),
            api_secret: account.api_secret.clone(),
        },
        args.trailing_stop_distance,
    ));
    crate::metrics::CONFIG_ACCOUNT
        .with_label_values(&[env.as_str(), account.mode.as_str()])
        .set(1);
    Venue { reconciler, watcher }
}

/// Reconnect adalah keputusan supervisor, bukan watcher.
fn supervise(watcher: Arc<FillWatcher>, env: Environment) {
    tokio::spawn(async move {
        loop {
            match watcher.run_session().await {
                Ok(()) => info!(%env, "order stream session ended"),
                Err(e) => warn!(%env, error = %e, "order stream session failed"),
            }
            sleep(RECONNECT_PAUSE).await;
        }
    });
}

async fn run(args: Args) -> Result<(), ExecError> {
    info!(
        http_port = args.http_port,
        sandbox = ?args.sandbox.as_ref().map(|a| a.mode.as_str()),
        production = ?args.production.as_ref().map(|a| a.mode.as_str()),
        lock_period_secs = args.lock_period_secs,
        trailing_stop = %args.trailing_stop_distance,
        redis = args.redis_url.is_some(),
        postgres = args.database_url.is_some(),
        telegram = args.telegram.is_some(),
        "startup config"
    );
    if args.sandbox.is_none() && args.production.is_none() {
        return Err(ExecError::Config("no Bybit account configured (BYBIT_SANDBOX_* / BYBIT_PROD_*)".into()));
    }

    // ---- Recorder (optional) ----
    let journal = match args.record_file.clone() {
        Some(path) => {
            let (rec_tx, rec_rx) = mpsc::channel::<JournalEvent>(8192);
            tokio::spawn(recorder::run(rec_rx, path));
            Journal::new(rec_tx)
        }
        None => Journal::disabled(),
    };
    journal.record(JournalEvent::Note { message: "startup".into() });

    // ---- Collaborators (fallback in-process kalau tidak dikonfigurasi) ----
    let notifier: Arc<dyn Notifier> = match &args.telegram {
        Some(t) => Arc::new(TelegramNotifier::new(&t.base_url, &t.bot_token, &t.chat_id)),
        None => {
            warn!("TELEGRAM_BOT_TOKEN/CHAT_ID not set, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };
    let lock: Arc<dyn LockStore> = match &args.redis_url {
        Some(url) => Arc::new(RedisLockStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set, using in-process lock (single instance only)");
            Arc::new(MemoryLockStore::new())
        }
    };
    let store: Arc<dyn OrderStore> = match &args.database_url {
        Some(url) => {
            let pg = PgOrderStore::connect(url).await?;
            pg.ensure_schema().await?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set, order history kept in memory");
            Arc::new(MemoryOrderStore::new())
        }
    };

    // ---- Venues ----
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ExecError::Transport(e.to_string()))?;

    let mut routes = Routes::default();
    let mut watchers = Vec::new();
    for (env, account) in [
        (Environment::Sandbox, args.sandbox.as_ref()),
        (Environment::Production, args.production.as_ref()),
    ] {
        let Some(account) = account else { continue };
        let venue = build_venue(env, account, &args, &http, store.clone(), notifier.clone(), journal.clone());
        supervise(venue.watcher.clone(), env);
        watchers.push((env, venue.watcher));
        match env {
            Environment::Sandbox => routes.sandbox = Some(venue.reconciler),
            Environment::Production => routes.production = Some(venue.reconciler),
        }
    }

    // Tunggu stream Ready supaya fill pertama tidak terlewat (tidak fatal)
    for (env, watcher) in &watchers {
        match timeout(READY_WAIT, watcher.wait_ready()).await {
            Ok(Ok(())) => info!(%env, "order stream ready"),
            _ => warn!(%env, state = ?watcher.state(), "order stream not ready yet, accepting signals anyway"),
        }
    }

    // ---- Intake + HTTP ----
    let intake = Arc::new(OrderIntake::new(
        lock,
        Sequencer::default(),
        store,
        notifier,
        journal,
        routes,
        Duration::from_secs(args.lock_period_secs),
    ));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));

    select! {
        res = ingress::serve(addr, intake) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
