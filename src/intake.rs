// ===============================
// src/intake.rs (lock -> record -> enqueue)
// ===============================
//
// Jalur intake tidak pernah menunggu eksekusi: validasi, ambil lock
// symbol-side, catat OrderRecord provisional, lalu serahkan ke sequencer.
// Error sebelum enqueue dinotifikasi lalu dikembalikan ke pemanggil.
//
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{Environment, ExecResult, JournalEvent, NewOrderRecord, Signal, SignalPayload};
use crate::error::ExecError;
use crate::lock::{lock_key, LockStore};
use crate::metrics::{DUPLICATES, INTAKE_ERRORS, SIGNALS};
use crate::notify::{notify_quietly, Notification, Notifier};
use crate::reconcile::Reconciler;
use crate::recorder::Journal;
use crate::sequencer::Sequencer;
use crate::store::OrderStore;

pub const RECEIVED: &str = "Order received successfully";
pub const ALREADY_PROCESSING: &str = "Order is already being processed";

/// Reconciler per account; a missing one means that environment is not configured.
#[derive(Clone, Default)]
pub struct Routes {
    pub sandbox: Option<Arc<Reconciler>>,
    pub production: Option<Arc<Reconciler>>,
}

impl Routes {
    pub fn get(&self, env: Environment) -> Result<Arc<Reconciler>, ExecError> {
        let slot = match env {
            Environment::Sandbox => &self.sandbox,
            Environment::Production => &self.production,
        };
        slot.clone()
            .ok_or_else(|| ExecError::InvalidSignal(format!("{env} account is not configured")))
    }
}

pub struct OrderIntake {
    lock: Arc<dyn LockStore>,
    sequencer: Sequencer,
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    routes: Routes,
    lock_period: Duration,
}

impl OrderIntake {
    pub fn new(
        lock: Arc<dyn LockStore>,
        sequencer: Sequencer,
        store: Arc<dyn OrderStore>,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
        routes: Routes,
        lock_period: Duration,
    ) -> Self {
        Self { lock, sequencer, store, notifier, journal, routes, lock_period }
    }

    pub fn routes(&self) -> &Routes { &self.routes }

    pub fn active_symbols(&self) -> usize { self.sequencer.active_workers() }

    /// Accepts a signal for execution. `Ok` means accepted or duplicate, not executed.
    pub async fn receive_order(&self, payload: SignalPayload) -> Result<ExecResult, ExecError> {
        match self.accept(payload.clone()).await {
            Ok(res) => Ok(res),
            Err(e) => {
                INTAKE_ERRORS.with_label_values(&[e.kind()]).inc();
                warn!(symbol = payload.symbol.as_deref().unwrap_or("-"), error = %e, "intake failed");
                let n = Notification {
                    symbol: payload.symbol.clone(),
                    side: payload.side.clone(),
                    category: payload.category.clone(),
                    order_type: payload.order_type.clone(),
                    qty: payload.qty.as_ref().map(raw_text),
                    error: Some(e.to_string()),
                    ..Notification::titled("❌ Order Failed: Failed to place a new order.")
                };
                notify_quietly(self.notifier.as_ref(), &n).await;
                Err(e)
            }
        }
    }

    async fn accept(&self, payload: SignalPayload) -> Result<ExecResult, ExecError> {
        let signal = Signal::try_from(payload)?;
        let env = signal.environment();
        let reconciler = self.routes.get(env)?;

        let key = lock_key(env, &signal.symbol, signal.side);
        if !self.lock.try_acquire(&key, self.lock_period).await? {
            DUPLICATES.inc();
            info!(%key, "duplicate signal dropped");
            return Ok(ExecResult::ok(ALREADY_PROCESSING));
        }
        SIGNALS.with_label_values(&[env.as_str()]).inc();

        let received = Notification {
            symbol: Some(signal.symbol.clone()),
            side: Some(signal.side.to_string()),
            category: Some(signal.category.clone()),
            order_type: Some(signal.order_type.clone()),
            qty: Some(signal.qty.to_string()),
            ..Notification::titled(format!("🔄 {env} Order Received."))
        };
        notify_quietly(self.notifier.as_ref(), &received).await;

        let record_id = self.store.insert(&NewOrderRecord::from(&signal)).await?;
        info!(record_id, symbol = %signal.symbol, side = %signal.side, qty = %signal.qty, %env, "signal accepted");
        self.journal.record(JournalEvent::Intake { record_id, signal: signal.clone() });

        let symbol = signal.symbol.clone();
        self.sequencer.enqueue(&symbol, async move {
            reconciler.reconcile(&signal, record_id).await;
        });
        Ok(ExecResult::ok(RECEIVED))
    }
}

fn raw_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
