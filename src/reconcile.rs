// ===============================
// src/reconcile.rs (per-signal state machine)
// ===============================
//
// Satu siklus per task sequencer:
//   qty == 0            -> close eksplisit (reduce-only), selesai
//   ada order pending   -> ignore
//   posisi searah       -> ignore
//   posisi berlawanan   -> close penuh (qty 0, reduce-only), TIDAK langsung entry
//   flat                -> normalisasi qty (margin + lot) lalu market order
//
// Setiap cabang terminal menghasilkan tepat satu notifikasi dan satu update
// OrderRecord. Error apa pun berakhir sebagai ExecResult gagal, tidak pernah
// dilempar ke sequencer.
//
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use tracing::{error, info, warn};

use crate::bybit::timestamp_ms;
use crate::domain::{
    Action, Environment, ExecResult, JournalEvent, OrderOutcome, OrderRequest, OutcomeStatus, Position, Side,
    Signal,
};
use crate::error::ExecError;
use crate::exchange::{AccountReader, Exchange, MarketData, OrderExecutor};
use crate::metrics::{LAT_RECONCILE, OUTCOMES, STORE_ERRORS};
use crate::notify::{notify_quietly, Notification, Notifier};
use crate::quantity::{self, MarginContext};
use crate::recorder::Journal;
use crate::store::OrderStore;

pub const SAME_DIRECTION: &str = "active position in same direction";
pub const PENDING_ORDERS: &str = "pending orders exist for symbol";

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore(&'static str),
    Close(Position),
    Enter,
}

/// Pure branch selection over a fresh snapshot.
pub fn decide(side: Side, positions: &[Position], has_pending: bool) -> Decision {
    if has_pending {
        return Decision::Ignore(PENDING_ORDERS);
    }
    let open = || positions.iter().filter(|p| p.is_open());
    if open().any(|p| p.side == Some(side)) {
        return Decision::Ignore(SAME_DIRECTION);
    }
    match open().find(|p| p.side == Some(side.opposite())) {
        Some(p) => Decision::Close(p.clone()),
        None => Decision::Enter,
    }
}

/// `SX-<ms>-<rand>`, within Bybit's 36 char orderLinkId limit.
pub fn order_link_id() -> String {
    format!("SX-{}-{:08x}", timestamp_ms(), rand::thread_rng().gen::<u32>())
}

/// What a terminal branch produced; sent and stored by `reconcile`.
struct Branch {
    outcome: OrderOutcome,
    notification: Notification,
}

pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    environment: Environment,
    default_leverage: u32,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn OrderStore>,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
        environment: Environment,
        default_leverage: u32,
    ) -> Self {
        Self { exchange, store, notifier, journal, environment, default_leverage }
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> { &self.exchange }

    /// Runs one signal to a terminal branch. Never returns an error.
    pub async fn reconcile(&self, signal: &Signal, record_id: i64) -> ExecResult {
        let started = Instant::now();
        let (branch, result) = match self.execute(signal, started).await {
            Ok(branch) => {
                let result = ExecResult::ok(branch.outcome.message.clone());
                (branch, result)
            }
            Err(e) => {
                error!(symbol = %signal.symbol, side = %signal.side, record_id, error = %e, "reconcile failed");
                (self.failure(signal, &e, started), ExecResult::failed(e.to_string()))
            }
        };

        OUTCOMES.with_label_values(&[branch.outcome.status.as_str()]).inc();
        LAT_RECONCILE.observe(started.elapsed().as_secs_f64() * 1000.0);

        notify_quietly(self.notifier.as_ref(), &branch.notification).await;
        if let Err(e) = self.store.update(record_id, &branch.outcome).await {
            STORE_ERRORS.inc();
            warn!(record_id, error = %e, "order record update failed");
        }
        self.journal.record(JournalEvent::Outcome {
            record_id,
            symbol: signal.symbol.clone(),
            outcome: branch.outcome,
        });
        result
    }

    async fn execute(&self, signal: &Signal, started: Instant) -> Result<Branch, ExecError> {
        if signal.qty.is_zero() {
            return self.close_explicit(signal, started).await;
        }

        let ex = &self.exchange;
        let (positions, has_pending, balance, ticker) = tokio::try_join!(
            ex.get_positions(&signal.category, &signal.symbol),
            ex.has_pending_orders(&signal.category, &signal.symbol),
            ex.get_balance(),
            ex.get_ticker(&signal.category, &signal.symbol),
        )?;

        match decide(signal.side, &positions, has_pending) {
            Decision::Ignore(reason) => Ok(self.ignored(signal, reason, started)),
            Decision::Close(position) => self.close_opposite(signal, position, ticker.last_price, started).await,
            Decision::Enter => {
                let leverage = signal
                    .leverage
                    .or_else(|| positions.iter().find_map(|p| p.leverage.and_then(|l| l.to_u32())))
                    .unwrap_or(self.default_leverage);
                let ctx = MarginContext {
                    available_balance: balance.available,
                    leverage: Decimal::from(leverage),
                    price: ticker.last_price,
                };
                self.enter(signal, leverage, ctx, started).await
            }
        }
    }

    fn base_notification(&self, signal: &Signal, emoji: &str, title: &str) -> Notification {
        Notification {
            symbol: Some(signal.symbol.clone()),
            side: Some(signal.side.to_string()),
            category: Some(signal.category.clone()),
            order_type: Some(signal.order_type.clone()),
            qty: Some(signal.qty.to_string()),
            ..Notification::titled(format!("{emoji} {} {title}", self.environment))
        }
    }

    fn ignored(&self, signal: &Signal, reason: &str, started: Instant) -> Branch {
        let message = format!("Ignored: {reason}");
        info!(symbol = %signal.symbol, side = %signal.side, %reason, "signal ignored");
        Branch {
            outcome: OrderOutcome::ignored(message.clone(), started.elapsed().as_secs_f64()),
            notification: Notification { error: Some(message), ..self.base_notification(signal, "⚠️", "Order Ignored.") },
        }
    }

    /// qty 0: reduce-only market order on the opposite side of the signal.
    async fn close_explicit(&self, signal: &Signal, started: Instant) -> Result<Branch, ExecError> {
        let closing = signal.side.opposite();
        let req = OrderRequest {
            category: signal.category.clone(),
            symbol: signal.symbol.clone(),
            side: closing,
            order_type: "Market".into(),
            qty: Decimal::ZERO,
            reduce_only: true,
            order_link_id: order_link_id(),
        };
        let ack = self.exchange.place_order(&req).await?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(symbol = %signal.symbol, side = %closing, order_id = %ack.order_id, "explicit close submitted");

        Ok(Branch {
            outcome: OrderOutcome {
                status: OutcomeStatus::Closed,
                action: Some(Action::Exit),
                quantity: Some(Decimal::ZERO),
                entry_price: None,
                exit_price: None,
                realized_pnl: None,
                leverage: signal.leverage,
                execution_time_seconds: elapsed,
                message: format!("Close order submitted ({})", ack.order_id),
            },
            notification: Notification {
                closing_side: Some(closing.to_string()),
                execution_time: Some(format_secs(elapsed)),
                ..self.base_notification(signal, "🔒", "Position Close Requested.")
            },
        })
    }

    /// Full close of the opposing position. No entry in the same cycle.
    async fn close_opposite(
        &self,
        signal: &Signal,
        position: Position,
        last_price: Decimal,
        started: Instant,
    ) -> Result<Branch, ExecError> {
        let req = OrderRequest {
            category: signal.category.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: "Market".into(),
            qty: Decimal::ZERO,
            reduce_only: true,
            order_link_id: order_link_id(),
        };
        let ack = self.exchange.place_order(&req).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let pnl = position.unrealized_pnl;
        let leverage = position.leverage.and_then(|l| l.to_u32());
        let closed_side = position.side.map(|s| s.to_string()).unwrap_or_default();
        info!(
            symbol = %signal.symbol,
            closed_side = %closed_side,
            size = %position.size,
            %pnl,
            order_id = %ack.order_id,
            "opposite position closed"
        );

        Ok(Branch {
            outcome: OrderOutcome {
                status: OutcomeStatus::Closed,
                action: Some(Action::Exit),
                quantity: Some(position.size),
                entry_price: Some(position.avg_entry_price),
                exit_price: Some(last_price),
                realized_pnl: Some(pnl),
                leverage,
                execution_time_seconds: elapsed,
                message: format!("Closed {closed_side} position of {}", position.size),
            },
            notification: Notification {
                closing_side: Some(closed_side),
                qty: Some(position.size.to_string()),
                entry_price: Some(position.avg_entry_price.to_string()),
                exit_price: Some(last_price.to_string()),
                pnl: Some(pnl.to_string()),
                leverage: leverage.map(|l| format!("{l}x")),
                execution_time: Some(format_secs(elapsed)),
                ..self.base_notification(signal, "🔒", "Position Closed.")
            },
        })
    }

    async fn enter(
        &self,
        signal: &Signal,
        leverage: u32,
        ctx: MarginContext,
        started: Instant,
    ) -> Result<Branch, ExecError> {
        if let Some(lev) = signal.leverage {
            self.exchange.set_leverage(&signal.category, &signal.symbol, lev).await?;
        }
        let qty =
            quantity::normalize_for_margin(self.exchange.as_ref(), &signal.category, &signal.symbol, signal.qty, &ctx)
                .await?;
        let req = OrderRequest {
            category: signal.category.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type.clone(),
            qty,
            reduce_only: false,
            order_link_id: order_link_id(),
        };
        let ack = self.exchange.place_order(&req).await?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(symbol = %signal.symbol, side = %signal.side, %qty, order_id = %ack.order_id, "entry submitted");

        Ok(Branch {
            outcome: OrderOutcome {
                status: OutcomeStatus::Entered,
                action: Some(Action::Entry),
                quantity: Some(qty),
                entry_price: Some(ctx.price),
                exit_price: None,
                realized_pnl: None,
                leverage: Some(leverage),
                execution_time_seconds: elapsed,
                message: format!("Order placed ({})", ack.order_id),
            },
            notification: Notification {
                qty: Some(qty.to_string()),
                entry_price: Some(ctx.price.to_string()),
                leverage: Some(format!("{leverage}x")),
                execution_time: Some(format_secs(elapsed)),
                ..self.base_notification(signal, "✅", "Order Placed.")
            },
        })
    }

    fn failure(&self, signal: &Signal, err: &ExecError, started: Instant) -> Branch {
        let elapsed = started.elapsed().as_secs_f64();
        Branch {
            outcome: OrderOutcome::failed(err.to_string(), elapsed),
            notification: Notification {
                error: Some(err.to_string()),
                execution_time: Some(format_secs(elapsed)),
                ..self.base_notification(signal, "❌", "Order Failed.")
            },
        }
    }
}

fn format_secs(secs: f64) -> String {
    format!("{secs:.3}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use serde_json::json;

    use crate::domain::{NewOrderRecord, SignalPayload};
    use crate::exchange::mock::{Call, MockExchange};
    use crate::lock::LOCK_PERIOD;
    use crate::notify::recording::RecordingNotifier;
    use crate::store::MemoryOrderStore;

    struct Harness {
        ex: Arc<MockExchange>,
        store: Arc<MemoryOrderStore>,
        notes: Arc<RecordingNotifier>,
        rec: Reconciler,
    }

    fn harness(ex: MockExchange) -> Harness {
        harness_with(ex, RecordingNotifier::default())
    }

    fn harness_with(ex: MockExchange, notes: RecordingNotifier) -> Harness {
        let ex = Arc::new(ex);
        let store = Arc::new(MemoryOrderStore::new());
        let notes = Arc::new(notes);
        let rec = Reconciler::new(
            ex.clone(),
            store.clone(),
            notes.clone(),
            Journal::disabled(),
            Environment::Sandbox,
            1,
        );
        Harness { ex, store, notes, rec }
    }

    fn signal(v: serde_json::Value) -> Signal {
        Signal::try_from(serde_json::from_value::<SignalPayload>(v).unwrap()).unwrap()
    }

    async fn run(h: &Harness, sig: &Signal) -> (ExecResult, OrderOutcome) {
        let id = h.store.insert(&NewOrderRecord::from(sig)).await.unwrap();
        let res = h.rec.reconcile(sig, id).await;
        let outcome = h.store.get(id).unwrap().outcome.expect("record updated");
        (res, outcome)
    }

    fn position(side: Side, size: Decimal) -> Position {
        Position {
            symbol: "SOLUSDT".into(),
            side: Some(side),
            size,
            avg_entry_price: dec!(150),
            mark_price: dec!(150),
            unrealized_pnl: Decimal::ZERO,
            leverage: None,
        }
    }

    #[test]
    fn decide_covers_every_snapshot_shape() {
        assert_eq!(decide(Side::Buy, &[], true), Decision::Ignore(PENDING_ORDERS));
        assert_eq!(decide(Side::Buy, &[position(Side::Buy, dec!(1))], false), Decision::Ignore(SAME_DIRECTION));
        let short = position(Side::Sell, dec!(0.5));
        assert_eq!(decide(Side::Buy, &[short.clone()], false), Decision::Close(short));
        assert_eq!(decide(Side::Buy, &[], false), Decision::Enter);
        // zero-size rows are flat
        assert_eq!(decide(Side::Buy, &[position(Side::Buy, Decimal::ZERO)], false), Decision::Enter);
    }

    #[test]
    fn order_link_ids_fit_bybit_limit_and_differ() {
        let a = order_link_id();
        let b = order_link_id();
        assert!(a.len() <= 36);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn flat_account_enters_with_step_rounded_qty() {
        let h = harness(MockExchange::new().with_lot(dec!(0.1), dec!(0.1), dec!(1000)));
        let sig = signal(json!({
            "category": "linear", "symbol": "SOLUSDT.P", "side": "sell",
            "orderType": "Market", "qty": "0.7", "sandbox": "true"
        }));

        let (res, outcome) = run(&h, &sig).await;

        assert!(res.success, "{res:?}");
        let placed = h.ex.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].symbol, "SOLUSDT");
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].qty, dec!(0.7));
        assert!(!placed[0].reduce_only);
        assert_eq!(outcome.status, OutcomeStatus::Entered);
        assert_eq!(outcome.action, Some(Action::Entry));
        assert_eq!(outcome.quantity, Some(dec!(0.7)));
        assert_eq!(outcome.entry_price, Some(dec!(150)));
        assert_eq!(h.notes.titles(), vec!["✅ Sandbox Order Placed.".to_string()]);
    }

    #[tokio::test]
    async fn opposite_position_is_closed_in_full_without_entry() {
        let h = harness(
            MockExchange::new()
                .with_position("SOLUSDT", Side::Sell, dec!(0.5), dec!(160), dec!(5))
                .with_price(dec!(150)),
        );
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "0.5"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(res.success);
        let placed = h.ex.placed();
        assert_eq!(placed.len(), 1, "close only, no entry");
        assert_eq!(placed[0].side, Side::Buy);
        assert_eq!(placed[0].qty, Decimal::ZERO);
        assert!(placed[0].reduce_only);

        assert_eq!(outcome.action, Some(Action::Exit));
        assert_eq!(outcome.realized_pnl, Some(dec!(5)));
        assert_eq!(outcome.entry_price, Some(dec!(160)));
        assert_eq!(outcome.exit_price, Some(dec!(150)));

        let notes = h.notes.all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pnl.as_deref(), Some("5"));
        assert_eq!(notes[0].entry_price.as_deref(), Some("160"));
        assert_eq!(notes[0].exit_price.as_deref(), Some("150"));
        assert_eq!(notes[0].closing_side.as_deref(), Some("Sell"));
    }

    #[tokio::test]
    async fn same_direction_position_submits_nothing() {
        let h = harness(MockExchange::new().with_position("SOLUSDT", Side::Buy, dec!(1), dec!(150), dec!(0)));
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(res.success);
        assert!(res.message.contains("same direction"));
        assert!(h.ex.calls().iter().all(|c| !c.is_mutation()));
        assert_eq!(outcome.status, OutcomeStatus::Ignored);
        assert_eq!(h.notes.all().len(), 1);
    }

    #[tokio::test]
    async fn pending_orders_block_new_orders() {
        let h = harness(MockExchange::new().with_pending_order("SOLUSDT"));
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let (_, outcome) = run(&h, &sig).await;

        assert!(h.ex.placed().is_empty());
        assert_eq!(outcome.status, OutcomeStatus::Ignored);
        assert!(outcome.message.contains("pending"));
    }

    #[tokio::test]
    async fn zero_qty_is_an_explicit_reduce_only_close() {
        for side in ["Buy", "Sell"] {
            let h = harness(MockExchange::new());
            let sig = signal(json!({"symbol": "SOLUSDT", "side": side, "qty": "0"}));

            let (res, outcome) = run(&h, &sig).await;

            assert!(res.success);
            let placed = h.ex.placed();
            assert_eq!(placed.len(), 1);
            assert_eq!(placed[0].side, sig.side.opposite());
            assert!(placed[0].reduce_only);
            assert_eq!(outcome.action, Some(Action::Exit));
            // no position/balance reads on the explicit close path
            assert!(!h.ex.calls().iter().any(|c| matches!(c, Call::Positions(_) | Call::Balance)));
        }
    }

    #[tokio::test]
    async fn signal_leverage_is_applied_and_caps_margin() {
        let h = harness(MockExchange::new().with_balance(dec!(100)).with_price(dec!(150)));
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "5", "leverage": 2}));

        let (_, outcome) = run(&h, &sig).await;

        assert!(h.ex.calls().contains(&Call::Leverage("SOLUSDT".into(), 2)));
        // 100 * 0.95 * 2 / 150 = 1.266 -> 1.2
        assert_eq!(h.ex.placed()[0].qty, dec!(1.2));
        assert_eq!(outcome.leverage, Some(2));
    }

    #[tokio::test]
    async fn absurd_qty_is_capped_by_margin() {
        let h = harness(MockExchange::new());
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "79228162514264337593543950335"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(res.success, "{res:?}");
        // 10000 * 0.95 / 150 = 63.33 -> 63.3
        assert_eq!(h.ex.placed()[0].qty, dec!(63.3));
        assert_eq!(outcome.status, OutcomeStatus::Entered);
        assert_eq!(h.notes.all().len(), 1);
    }

    #[tokio::test]
    async fn unrepresentable_qty_fails_cleanly() {
        let h = harness(
            MockExchange::new()
                .with_balance(Decimal::MAX)
                .with_lot(dec!(0.0001), dec!(0.0001), dec!(1000)),
        );
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "79228162514264337593543950335"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(!res.success);
        assert!(h.ex.placed().is_empty());
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        let notes = h.notes.all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "❌ Sandbox Order Failed.");
    }

    #[tokio::test]
    async fn exchange_failure_becomes_failed_result_and_one_notification() {
        let h = harness(
            MockExchange::new()
                .failing_place(ExecError::Exchange { code: 110007, message: "ab not enough".into() }),
        );
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(!res.success);
        assert!(res.message.contains("ab not enough"));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        let notes = h.notes.all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "❌ Sandbox Order Failed.");
        assert!(notes[0].error.as_deref().unwrap_or("").contains("110007"));
    }

    #[tokio::test]
    async fn read_failure_never_places_an_order() {
        let h = harness(MockExchange::new().failing_positions(ExecError::Transport("timeout".into())));
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(!res.success);
        assert!(h.ex.placed().is_empty());
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_change_outcome() {
        let h = harness_with(MockExchange::new(), RecordingNotifier::failing());
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let (res, outcome) = run(&h, &sig).await;

        assert!(res.success);
        assert_eq!(outcome.status, OutcomeStatus::Entered);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_finishes_well_inside_lock_period() {
        let ex = MockExchange { latency: Duration::from_millis(100), ..MockExchange::new() };
        let h = harness(ex);
        let sig = signal(json!({"symbol": "SOLUSDT", "side": "Buy", "qty": "1"}));

        let start = tokio::time::Instant::now();
        run(&h, &sig).await;

        assert!(start.elapsed() < LOCK_PERIOD / 4, "took {:?}", start.elapsed());
    }
}
