// ===============================
// src/exchange.rs (capability-typed adapter seam)
// ===============================
use async_trait::async_trait;

use crate::domain::{
    Balance, LotSizeFilter, OpenOrder, OrderAck, OrderRequest, Position, Ticker, TrailingStopRequest,
};
use crate::error::ExecError;

/// Read-only account state.
#[async_trait]
pub trait AccountReader: Send + Sync {
    async fn get_positions(&self, category: &str, symbol: &str) -> Result<Vec<Position>, ExecError>;
    async fn get_open_orders(&self, category: &str, symbol: &str) -> Result<Vec<OpenOrder>, ExecError>;
    async fn get_balance(&self) -> Result<Balance, ExecError>;

    /// True when any open order sits in Created/New/Processing.
    async fn has_pending_orders(&self, category: &str, symbol: &str) -> Result<bool, ExecError> {
        let orders = self.get_open_orders(category, symbol).await?;
        Ok(orders.iter().any(|o| o.status.is_pending()))
    }
}

/// Public market data.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_ticker(&self, category: &str, symbol: &str) -> Result<Ticker, ExecError>;
    async fn get_instrument(&self, category: &str, symbol: &str) -> Result<LotSizeFilter, ExecError>;
}

/// Anything that mutates the account.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExecError>;
    async fn cancel_order(&self, category: &str, symbol: &str, order_id: &str) -> Result<(), ExecError>;
    async fn cancel_all_orders(&self, category: &str, symbol: &str) -> Result<(), ExecError>;
    async fn set_leverage(&self, category: &str, symbol: &str, leverage: u32) -> Result<(), ExecError>;
    async fn set_trailing_stop(&self, req: &TrailingStopRequest) -> Result<(), ExecError>;
}

/// Full adapter; blanket-implemented for anything with all three capabilities.
pub trait Exchange: AccountReader + MarketData + OrderExecutor {}

impl<T: AccountReader + MarketData + OrderExecutor> Exchange for T {}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory exchange. Every call is recorded for assertions.
    use std::sync::Mutex;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::{OrderStatus, Side};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Positions(String),
        OpenOrders(String),
        Balance,
        Ticker(String),
        Instrument(String),
        Place(OrderRequest),
        Cancel(String),
        CancelAll(String),
        Leverage(String, u32),
        TrailingStop(TrailingStopRequest),
    }

    impl Call {
        pub fn is_mutation(&self) -> bool {
            matches!(
                self,
                Call::Place(_) | Call::Cancel(_) | Call::CancelAll(_) | Call::Leverage(..) | Call::TrailingStop(_)
            )
        }
    }

    pub struct MockExchange {
        pub positions: Mutex<Vec<Position>>,
        /// Category the scripted positions live under.
        pub position_category: String,
        pub open_orders: Mutex<Vec<OpenOrder>>,
        pub balance: Mutex<Balance>,
        pub last_price: Mutex<Decimal>,
        pub lot: Mutex<LotSizeFilter>,
        pub fail_place: Mutex<Option<ExecError>>,
        pub fail_positions: Mutex<Option<ExecError>>,
        pub latency: Duration,
        pub calls: Mutex<Vec<Call>>,
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self {
                positions: Mutex::new(Vec::new()),
                position_category: "linear".to_string(),
                open_orders: Mutex::new(Vec::new()),
                balance: Mutex::new(Balance { total_equity: dec!(10000), available: dec!(10000) }),
                last_price: Mutex::new(dec!(150)),
                lot: Mutex::new(LotSizeFilter {
                    qty_step: dec!(0.1),
                    min_order_qty: dec!(0.1),
                    max_order_qty: dec!(1000),
                }),
                fail_place: Mutex::new(None),
                fail_positions: Mutex::new(None),
                latency: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockExchange {
        pub fn new() -> Self { Self::default() }

        pub fn with_position(self, symbol: &str, side: Side, size: Decimal, entry: Decimal, upnl: Decimal) -> Self {
            self.positions.lock().unwrap().push(Position {
                symbol: symbol.to_string(),
                side: Some(side),
                size,
                avg_entry_price: entry,
                mark_price: entry,
                unrealized_pnl: upnl,
                leverage: Some(dec!(10)),
            });
            self
        }

        pub fn in_category(mut self, category: &str) -> Self {
            self.position_category = category.to_string();
            self
        }

        pub fn with_pending_order(self, symbol: &str) -> Self {
            self.open_orders.lock().unwrap().push(OpenOrder {
                order_id: "pending-1".into(),
                symbol: symbol.to_string(),
                side: Some(Side::Buy),
                status: OrderStatus::New,
            });
            self
        }

        pub fn with_balance(self, available: Decimal) -> Self {
            *self.balance.lock().unwrap() = Balance { total_equity: available, available };
            self
        }

        pub fn with_price(self, price: Decimal) -> Self {
            *self.last_price.lock().unwrap() = price;
            self
        }

        pub fn with_lot(self, step: Decimal, min: Decimal, max: Decimal) -> Self {
            *self.lot.lock().unwrap() = LotSizeFilter { qty_step: step, min_order_qty: min, max_order_qty: max };
            self
        }

        pub fn failing_place(self, err: ExecError) -> Self {
            *self.fail_place.lock().unwrap() = Some(err);
            self
        }

        pub fn failing_positions(self, err: ExecError) -> Self {
            *self.fail_positions.lock().unwrap() = Some(err);
            self
        }

        pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

        pub fn placed(&self) -> Vec<OrderRequest> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c { Call::Place(r) => Some(r), _ => None })
                .collect()
        }

        async fn record(&self, call: Call) {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl AccountReader for MockExchange {
        async fn get_positions(&self, category: &str, symbol: &str) -> Result<Vec<Position>, ExecError> {
            self.record(Call::Positions(symbol.to_string())).await;
            if let Some(e) = self.fail_positions.lock().unwrap().clone() {
                return Err(e);
            }
            if category != self.position_category {
                return Ok(Vec::new());
            }
            Ok(self.positions.lock().unwrap().iter().filter(|p| p.symbol == symbol).cloned().collect())
        }

        async fn get_open_orders(&self, _category: &str, symbol: &str) -> Result<Vec<OpenOrder>, ExecError> {
            self.record(Call::OpenOrders(symbol.to_string())).await;
            Ok(self.open_orders.lock().unwrap().iter().filter(|o| o.symbol == symbol).cloned().collect())
        }

        async fn get_balance(&self) -> Result<Balance, ExecError> {
            self.record(Call::Balance).await;
            Ok(self.balance.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl MarketData for MockExchange {
        async fn get_ticker(&self, _category: &str, symbol: &str) -> Result<Ticker, ExecError> {
            self.record(Call::Ticker(symbol.to_string())).await;
            Ok(Ticker { symbol: symbol.to_string(), last_price: *self.last_price.lock().unwrap() })
        }

        async fn get_instrument(&self, _category: &str, symbol: &str) -> Result<LotSizeFilter, ExecError> {
            self.record(Call::Instrument(symbol.to_string())).await;
            Ok(self.lot.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl OrderExecutor for MockExchange {
        async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExecError> {
            self.record(Call::Place(req.clone())).await;
            if let Some(e) = self.fail_place.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(OrderAck { order_id: format!("order-{}", req.order_link_id), order_link_id: req.order_link_id.clone() })
        }

        async fn cancel_order(&self, _category: &str, _symbol: &str, order_id: &str) -> Result<(), ExecError> {
            self.record(Call::Cancel(order_id.to_string())).await;
            Ok(())
        }

        async fn cancel_all_orders(&self, _category: &str, symbol: &str) -> Result<(), ExecError> {
            self.record(Call::CancelAll(symbol.to_string())).await;
            Ok(())
        }

        async fn set_leverage(&self, _category: &str, symbol: &str, leverage: u32) -> Result<(), ExecError> {
            self.record(Call::Leverage(symbol.to_string(), leverage)).await;
            Ok(())
        }

        async fn set_trailing_stop(&self, req: &TrailingStopRequest) -> Result<(), ExecError> {
            self.record(Call::TrailingStop(req.clone())).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;

    #[tokio::test]
    async fn pending_flag_only_counts_live_statuses() {
        let ex = MockExchange::new();
        assert!(!ex.has_pending_orders("linear", "SOLUSDT").await.unwrap());

        let ex = MockExchange::new().with_pending_order("SOLUSDT");
        assert!(ex.has_pending_orders("linear", "SOLUSDT").await.unwrap());
        assert!(!ex.has_pending_orders("linear", "BTCUSDT").await.unwrap());
    }
}
