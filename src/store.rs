// ===============================
// src/store.rs (order history)
// ===============================
//
// Riwayat order append-only: satu baris dibuat saat intake, lalu di-update
// tepat sekali oleh jalur eksekusi (entry/exit/ignored/failed). Tidak ada delete.
//
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::domain::{NewOrderRecord, OrderOutcome, OrderRecord};
use crate::error::ExecError;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Provisional row; returns its generated id.
    async fn insert(&self, order: &NewOrderRecord) -> Result<i64, ExecError>;
    /// Write outcome fields. A second update for the same id is an error.
    async fn update(&self, id: i64, outcome: &OrderOutcome) -> Result<(), ExecError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id                      BIGSERIAL PRIMARY KEY,
    symbol                  TEXT NOT NULL,
    side                    TEXT NOT NULL,
    category                TEXT NOT NULL,
    type                    TEXT NOT NULL,
    quantity                NUMERIC NOT NULL,
    environment             TEXT NOT NULL,
    action                  TEXT,
    status                  TEXT,
    entry_price             NUMERIC,
    exit_price              NUMERIC,
    realized_pnl            NUMERIC,
    leverage                INTEGER,
    execution_time_seconds  DOUBLE PRECISION,
    message                 TEXT,
    created_at              TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at              TIMESTAMPTZ
)
"#;

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn connect(url: &str) -> Result<Self, ExecError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        info!("postgres order store connected");
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), ExecError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// `leverage` is an INTEGER column.
fn leverage_column(leverage: Option<u32>) -> Result<Option<i32>, ExecError> {
    leverage
        .map(|l| {
            i32::try_from(l).map_err(|_| ExecError::Store(format!("leverage {l} does not fit the orders table")))
        })
        .transpose()
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &NewOrderRecord) -> Result<i64, ExecError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (symbol, side, category, type, quantity, environment, leverage)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(&order.category)
        .bind(&order.order_type)
        .bind(order.quantity)
        .bind(order.environment.as_str())
        .bind(leverage_column(order.leverage)?)
        .fetch_one(&self.pool)
        .await?;
        debug!(record_id = id, symbol = %order.symbol, "order record inserted");
        Ok(id)
    }

    async fn update(&self, id: i64, outcome: &OrderOutcome) -> Result<(), ExecError> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = $2,
                action = $3,
                quantity = COALESCE($4, quantity),
                entry_price = $5,
                exit_price = $6,
                realized_pnl = $7,
                leverage = COALESCE($8, leverage),
                execution_time_seconds = $9,
                message = $10,
                updated_at = now()
            WHERE id = $1 AND updated_at IS NULL
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.action.map(|a| a.as_str()))
        .bind(outcome.quantity)
        .bind(outcome.entry_price)
        .bind(outcome.exit_price)
        .bind(outcome.realized_pnl)
        .bind(leverage_column(outcome.leverage)?)
        .bind(outcome.execution_time_seconds)
        .bind(&outcome.message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ExecError::Store(format!("order {id} missing or already finalised")));
        }
        Ok(())
    }
}

/// Process-local store for runs without `DATABASE_URL`.
#[derive(Default)]
pub struct MemoryOrderStore {
    rows: Mutex<Vec<OrderRecord>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, id: i64) -> Option<OrderRecord> {
        self.rows.lock().ok()?.iter().find(|r| r.id == id).cloned()
    }

    pub fn all(&self) -> Vec<OrderRecord> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &NewOrderRecord) -> Result<i64, ExecError> {
        let mut rows = self.rows.lock().map_err(|_| ExecError::Store("poisoned".into()))?;
        let id = rows.len() as i64 + 1;
        rows.push(OrderRecord { id, order: order.clone(), outcome: None });
        Ok(id)
    }

    async fn update(&self, id: i64, outcome: &OrderOutcome) -> Result<(), ExecError> {
        let mut rows = self.rows.lock().map_err(|_| ExecError::Store("poisoned".into()))?;
        match rows.iter_mut().find(|r| r.id == id) {
            Some(r) if r.outcome.is_none() => {
                r.outcome = Some(outcome.clone());
                Ok(())
            }
            _ => Err(ExecError::Store(format!("order {id} missing or already finalised"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Environment, Side};
    use rust_decimal_macros::dec;

    fn new_order() -> NewOrderRecord {
        NewOrderRecord {
            symbol: "SOLUSDT".into(),
            side: Side::Sell,
            category: "linear".into(),
            order_type: "Market".into(),
            quantity: dec!(0.7),
            environment: Environment::Sandbox,
            leverage: None,
        }
    }

    #[tokio::test]
    async fn record_is_updated_exactly_once() {
        let store = MemoryOrderStore::new();
        let id = store.insert(&new_order()).await.unwrap();
        assert!(store.get(id).unwrap().outcome.is_none());

        store.update(id, &OrderOutcome::ignored("busy", 0.1)).await.unwrap();
        assert!(store.update(id, &OrderOutcome::failed("again", 0.2)).await.is_err());
        assert_eq!(store.get(id).unwrap().outcome.unwrap().message, "busy");
    }

    #[test]
    fn leverage_column_rejects_values_beyond_integer() {
        assert_eq!(leverage_column(None).unwrap(), None);
        assert_eq!(leverage_column(Some(10)).unwrap(), Some(10));
        assert!(matches!(leverage_column(Some(u32::MAX)), Err(ExecError::Store(_))));
    }

    #[tokio::test]
    async fn unknown_id_cannot_be_updated() {
        let store = MemoryOrderStore::new();
        assert!(matches!(
            store.update(99, &OrderOutcome::ignored("x", 0.0)).await,
            Err(ExecError::Store(_))
        ));
    }
}
