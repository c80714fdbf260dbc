// ===============================
// src/quantity.rs (lot size + margin clamp)
// ===============================
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::info;

use crate::domain::LotSizeFilter;
use crate::error::ExecError;
use crate::exchange::MarketData;

/// Buffer kept free for slippage and fees when sizing against margin.
pub const MARGIN_SAFETY: Decimal = dec!(0.95);

#[derive(Debug, Clone, Copy)]
pub struct MarginContext {
    pub available_balance: Decimal,
    pub leverage: Decimal,
    pub price: Decimal,
}

/// Floor to a multiple of `step`, keeping no more decimals than `step` has.
pub fn round_down_to_step(qty: Decimal, step: Decimal) -> Result<Decimal, ExecError> {
    if step <= Decimal::ZERO {
        return Err(ExecError::DataIntegrity(format!("qtyStep must be positive, got {step}")));
    }
    let floored = qty
        .checked_div(step)
        .and_then(|steps| steps.floor().checked_mul(step))
        .ok_or_else(|| ExecError::DataIntegrity(format!("qty {qty} does not fit step {step}")))?;
    Ok(floored.round_dp_with_strategy(step.normalize().scale(), RoundingStrategy::ToZero))
}

pub fn clamp(qty: Decimal, lot: &LotSizeFilter) -> Decimal {
    if qty < lot.min_order_qty {
        lot.min_order_qty
    } else if qty > lot.max_order_qty {
        lot.max_order_qty
    } else {
        qty
    }
}

/// Step-round then clamp into [min, max].
pub fn legalize(desired: Decimal, lot: &LotSizeFilter) -> Result<Decimal, ExecError> {
    Ok(clamp(round_down_to_step(desired, lot.qty_step)?, lot))
}

/// Caps `requested` when its notional exceeds the available balance.
/// A notional too large for `Decimal` is over any balance and gets capped too.
pub fn margin_cap(requested: Decimal, ctx: &MarginContext) -> Result<Decimal, ExecError> {
    if ctx.price <= Decimal::ZERO {
        return Err(ExecError::DataIntegrity(format!("non-positive price {}", ctx.price)));
    }
    match requested.checked_mul(ctx.price) {
        Some(notional) if notional <= ctx.available_balance => return Ok(requested),
        _ => {}
    }
    let max_position = ctx
        .available_balance
        .checked_mul(MARGIN_SAFETY)
        .and_then(|m| m.checked_mul(ctx.leverage))
        .and_then(|m| m.checked_div(ctx.price))
        .ok_or_else(|| ExecError::DataIntegrity(format!("margin size overflow at price {}", ctx.price)))?;
    Ok(requested.min(max_position))
}

/// Exchange-legal quantity for `symbol`.
pub async fn normalize<M>(market: &M, category: &str, symbol: &str, desired: Decimal) -> Result<Decimal, ExecError>
where
    M: MarketData + ?Sized,
{
    let lot = market.get_instrument(category, symbol).await?;
    legalize(desired, &lot)
}

/// Margin-safe and exchange-legal quantity for `symbol`.
pub async fn normalize_for_margin<M>(
    market: &M,
    category: &str,
    symbol: &str,
    requested: Decimal,
    ctx: &MarginContext,
) -> Result<Decimal, ExecError>
where
    M: MarketData + ?Sized,
{
    let capped = margin_cap(requested, ctx)?;
    if capped < requested {
        info!(%symbol, %requested, %capped, available = %ctx.available_balance, "qty capped by margin");
    }
    normalize(market, category, symbol, capped).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;

    fn lot(step: Decimal, min: Decimal, max: Decimal) -> LotSizeFilter {
        LotSizeFilter { qty_step: step, min_order_qty: min, max_order_qty: max }
    }

    #[test]
    fn rounds_down_to_step_precision() {
        assert_eq!(round_down_to_step(dec!(0.466), dec!(0.1)).unwrap(), dec!(0.4));
        assert_eq!(round_down_to_step(dec!(0.7), dec!(0.1)).unwrap(), dec!(0.7));
        assert_eq!(round_down_to_step(dec!(12.3456), dec!(0.001)).unwrap(), dec!(12.345));
        assert_eq!(round_down_to_step(dec!(7), dec!(5)).unwrap(), dec!(5));
        assert_eq!(round_down_to_step(dec!(0.466), dec!(0.10)).unwrap().scale(), 1);
    }

    #[test]
    fn zero_step_is_data_integrity_error() {
        assert!(matches!(round_down_to_step(dec!(1), Decimal::ZERO), Err(ExecError::DataIntegrity(_))));
    }

    #[test]
    fn oversized_quantities_error_or_cap_instead_of_overflowing() {
        assert!(matches!(round_down_to_step(Decimal::MAX, dec!(0.1)), Err(ExecError::DataIntegrity(_))));

        let ctx = MarginContext { available_balance: dec!(1000), leverage: dec!(1), price: dec!(150) };
        let capped = margin_cap(Decimal::MAX, &ctx).unwrap();
        assert!(capped > dec!(6.33) && capped < dec!(6.34));

        let huge = MarginContext { available_balance: Decimal::MAX, leverage: dec!(100), price: dec!(2) };
        assert!(matches!(margin_cap(Decimal::MAX, &huge), Err(ExecError::DataIntegrity(_))));
    }

    #[test]
    fn clamps_into_lot_bounds() {
        let l = lot(dec!(0.1), dec!(0.1), dec!(100));
        assert_eq!(legalize(dec!(0.05), &l).unwrap(), dec!(0.1));
        assert_eq!(legalize(dec!(250.77), &l).unwrap(), dec!(100));
        assert_eq!(legalize(dec!(3.14), &l).unwrap(), dec!(3.1));
    }

    #[test]
    fn legal_quantities_are_fixed_points() {
        let lots = [
            lot(dec!(0.1), dec!(0.1), dec!(100)),
            lot(dec!(0.001), dec!(0.001), dec!(50)),
            lot(dec!(1), dec!(1), dec!(10000)),
        ];
        let inputs = [dec!(0), dec!(0.0004), dec!(0.7), dec!(1.23456), dec!(99.99), dec!(12345.678)];
        for l in &lots {
            for q in inputs {
                let once = legalize(q, l).unwrap();
                assert_eq!(legalize(once, l).unwrap(), once, "lot {l:?} q {q}");
                assert!(once >= l.min_order_qty && once <= l.max_order_qty);
                assert_eq!(once % l.qty_step, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn notional_within_balance_is_left_alone() {
        let ctx = MarginContext { available_balance: dec!(1000), leverage: dec!(1), price: dec!(150) };
        assert_eq!(margin_cap(dec!(0.7), &ctx).unwrap(), dec!(0.7));
    }

    #[test]
    fn notional_over_balance_is_capped_at_95_percent_margin() {
        let ctx = MarginContext { available_balance: dec!(100), leverage: dec!(2), price: dec!(150) };
        // 100 * 0.95 * 2 / 150 = 1.2666..
        let capped = margin_cap(dec!(5), &ctx).unwrap();
        assert!(capped > dec!(1.26) && capped < dec!(1.27));
        assert_eq!(round_down_to_step(capped, dec!(0.1)).unwrap(), dec!(1.2));
    }

    #[tokio::test]
    async fn normalize_for_margin_caps_before_rounding() {
        let ex = MockExchange::new().with_lot(dec!(0.1), dec!(0.1), dec!(1000));
        let ctx = MarginContext { available_balance: dec!(100), leverage: dec!(1), price: dec!(150) };
        // cap = 100 * 0.95 / 150 = 0.6333 -> 0.6
        let q = normalize_for_margin(&ex, "linear", "SOLUSDT", dec!(1), &ctx).await.unwrap();
        assert_eq!(q, dec!(0.6));
    }
}
