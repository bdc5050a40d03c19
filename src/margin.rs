//! Margin calculation for linear and inverse contracts.
//!
//! A [`MarginCalculator`] is bound to one instrument and one mark price and
//! is otherwise stateless. Linear contracts are valued in the quote asset
//! (`|q| × p`), inverse contracts in the base asset (`|q| × m / p`).
//!
//! Entry value is kept signed so partial fills at different prices average
//! correctly: linear `−Σ q × p`, inverse `Σ q × m / p`.
//!
//! Liquidation and bankrupt prices that can never be reached are clamped:
//! `0` when the price would have to drop below zero, `Decimal::MAX` when it
//! would have to rise without bound.

use crate::instrument::Instrument;
use crate::position::Position;
use crate::types::{ContractType, MarginMode, Price, Side};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Maintenance parameters of the tier a position currently falls in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaintenanceTier {
    pub rate: Decimal,
    pub amount: Decimal,
}

impl MaintenanceTier {
    pub fn new(rate: Decimal, amount: Decimal) -> Self {
        Self { rate, amount }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarginCalculator<'a> {
    instrument: &'a Instrument,
    mark: Price,
}

impl<'a> MarginCalculator<'a> {
    pub fn new(instrument: &'a Instrument, mark: Price) -> Self {
        Self { instrument, mark }
    }

    pub fn mark(&self) -> Decimal {
        self.mark.value()
    }

    fn multiplier(&self) -> Decimal {
        self.instrument.effective_multiplier()
    }

    fn linear(&self) -> bool {
        self.instrument.contract_type == ContractType::Linear
    }

    // 3.1: position value at a price. always non-negative.
    pub fn value_at(&self, qty: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        if self.linear() {
            qty.abs() * price
        } else {
            qty.abs() * self.multiplier() / price
        }
    }

    pub fn value_at_mark(&self, qty: Decimal) -> Decimal {
        self.value_at(qty, self.mark())
    }

    /// Signed entry value contributed by `qty` (signed) traded at `price`.
    pub fn entry_value_delta(&self, qty: Decimal, price: Decimal) -> Decimal {
        if self.linear() {
            -qty * price
        } else {
            qty * self.multiplier() / price
        }
    }

    pub fn entry_price(&self, qty: Decimal, entry_value: Decimal) -> Decimal {
        if qty.is_zero() || entry_value.is_zero() {
            return Decimal::ZERO;
        }
        if self.linear() {
            -entry_value / qty
        } else {
            qty * self.multiplier() / entry_value
        }
    }

    // 3.2: isolated margin posted when opening `qty` at `price`
    pub fn open_margin(&self, qty: Decimal, price: Decimal, leverage: Decimal) -> Decimal {
        self.value_at(qty, price) / leverage
    }

    pub fn allocated_margin(&self, position: &Position) -> Decimal {
        match position.margin_mode {
            MarginMode::Cross => self.cross_margin(position.current_qty, position.leverage.value()),
            MarginMode::Isolated => position.position_margin + position.adjust_margin,
        }
    }

    pub fn cross_margin(&self, qty: Decimal, leverage: Decimal) -> Decimal {
        self.value_at_mark(qty) / leverage
    }

    // 3.3: unrealized pnl from the signed entry value
    pub fn unrealized_pnl(&self, qty: Decimal, entry_value: Decimal) -> Decimal {
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        if self.linear() {
            qty * self.mark() + entry_value
        } else {
            entry_value - qty * self.multiplier() / self.mark()
        }
    }

    /// Entry value released by closing `close_size` (unsigned) of the position.
    pub fn close_value(&self, qty: Decimal, entry_value: Decimal, close_size: Decimal) -> Decimal {
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        entry_value * close_size / qty.abs()
    }

    /// Realized pnl of closing `close_size` (unsigned) at `exit_price`.
    pub fn realized_pnl(&self, qty: Decimal, entry_value: Decimal, close_size: Decimal, exit_price: Decimal) -> Decimal {
        if qty.is_zero() || exit_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let close_value = self.close_value(qty, entry_value, close_size);
        let close_qty = if qty > Decimal::ZERO { close_size } else { -close_size };
        if self.linear() {
            exit_price * close_qty + close_value
        } else {
            close_value - close_qty * self.multiplier() / exit_price
        }
    }

    pub fn fee(&self, size: Decimal, price: Decimal, rate: Decimal) -> Decimal {
        self.value_at(size, price) * rate
    }

    pub fn maintenance_margin(&self, qty: Decimal, tier: MaintenanceTier) -> Decimal {
        (self.value_at_mark(qty) * tier.rate - tier.amount).max(Decimal::ZERO)
    }

    // 3.4: price at which equity hits maintenance margin, given margin `m`
    pub fn liquidation_price(&self, qty: Decimal, entry_value: Decimal, margin: Decimal, tier: MaintenanceTier) -> Decimal {
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        if self.linear() {
            let denominator = qty - qty.abs() * tier.rate;
            clamp_linear((-entry_value - margin - tier.amount).checked_div(denominator))
        } else {
            let numerator = self.multiplier() * (qty + qty.abs() * tier.rate);
            clamp_inverse(numerator.checked_div(margin + tier.amount + entry_value))
        }
    }

    /// Price at which equity reaches zero.
    pub fn bankrupt_price(&self, qty: Decimal, entry_value: Decimal, margin: Decimal) -> Decimal {
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        if self.linear() {
            clamp_linear((-entry_value - margin).checked_div(qty))
        } else {
            clamp_inverse((qty * self.multiplier()).checked_div(margin + entry_value))
        }
    }

    /// Worst-case exit cost pre-reserved by isolated positions.
    pub fn tmp_total_fee(&self, qty: Decimal, liquidation_price: Decimal, clearance_rate: Decimal) -> Decimal {
        // an unbounded liquidation price says nothing about exit value
        let price = if is_bounded(liquidation_price) {
            liquidation_price
        } else {
            self.mark()
        };
        (clearance_rate + self.instrument.taker_fee_rate * Decimal::TWO) * self.value_at(qty, price)
    }

    // 3.5: per-unit reservation for a resting buy at `price`
    pub fn mul_buy(&self, price: Decimal, leverage: Decimal) -> Decimal {
        let taker = self.instrument.taker_fee_rate;
        let mark = self.mark();
        if self.linear() {
            price / leverage
                + (price - mark).max(Decimal::ZERO)
                + price * taker
                + price * (Decimal::ONE - Decimal::ONE / leverage) * taker
        } else {
            let m = self.multiplier();
            m / (price * leverage)
                + m * (Decimal::ONE / mark - Decimal::ONE / price).max(Decimal::ZERO)
                + m * taker / price
                + m * taker * (leverage + Decimal::ONE) / (price * leverage)
        }
    }

    pub fn mul_sell(&self, price: Decimal, leverage: Decimal) -> Decimal {
        let taker = self.instrument.taker_fee_rate;
        let mark = self.mark();
        if self.linear() {
            price / leverage
                + (mark - price).max(Decimal::ZERO)
                + price * taker
                + price * (Decimal::ONE + Decimal::ONE / leverage) * taker
        } else {
            let m = self.multiplier();
            m / (price * leverage)
                + m * (Decimal::ONE / price - Decimal::ONE / mark).max(Decimal::ZERO)
                + m * taker / price
                + m * taker * (leverage - Decimal::ONE) / (price * leverage)
        }
    }

    /// Part of an order that opens exposure. Only the flip beyond the current
    /// position opens when the order is on the closing side.
    pub fn open_size(&self, side: Side, size: Decimal, current_qty: Decimal) -> Decimal {
        let closing = Side::closing(current_qty) == Some(side);
        if closing {
            (size - current_qty.abs()).max(Decimal::ZERO)
        } else {
            size
        }
    }

    /// Raw reservation of an order on `side`.
    pub fn order_reservation(&self, side: Side, open_size: Decimal, price: Decimal, leverage: Decimal) -> Decimal {
        if open_size <= Decimal::ZERO || price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let per_unit = match side {
            Side::Buy => self.mul_buy(price, leverage),
            Side::Sell => self.mul_sell(price, leverage),
        };
        open_size * per_unit
    }

    pub fn funding_fee(&self, qty_at_time: Decimal, rate: Decimal) -> Decimal {
        let rate = rate / Decimal::ONE_HUNDRED;
        if self.linear() {
            -self.mark() * qty_at_time * rate
        } else {
            -qty_at_time * self.multiplier() * rate / self.mark()
        }
    }

    // 3.6: adl ordering score. values here are q × price for both contract types.
    pub fn pnl_ranking(&self, qty: Decimal, entry_price: Decimal, bankrupt_price: Decimal) -> Decimal {
        pnl_ranking(qty, entry_price, self.mark(), bankrupt_price)
    }
}

/// Increase of `max(mar_buy, mar_sel)` caused by reserving `raw` more on `side`.
pub fn charged_cost(side: Side, raw: Decimal, mar_buy: Decimal, mar_sel: Decimal) -> Decimal {
    let (own, opposite) = match side {
        Side::Buy => (mar_buy, mar_sel),
        Side::Sell => (mar_sel, mar_buy),
    };
    if own >= opposite {
        raw
    } else {
        (own + raw - opposite).max(Decimal::ZERO)
    }
}

/// Share of `reserved` released when `released_qty` of `quantity` goes away.
pub fn prorate(reserved: Decimal, released_qty: Decimal, quantity: Decimal) -> Decimal {
    if quantity.is_zero() {
        return Decimal::ZERO;
    }
    if released_qty >= quantity {
        return reserved;
    }
    (reserved * released_qty / quantity).min(reserved)
}

pub fn pnl_ranking(qty: Decimal, entry_price: Decimal, mark: Decimal, bankrupt_price: Decimal) -> Decimal {
    if qty.is_zero() || entry_price.is_zero() {
        return Decimal::ZERO;
    }
    let (Some(mark_value), Some(entry_value)) = (qty.checked_mul(mark), qty.checked_mul(entry_price)) else {
        return Decimal::ZERO;
    };
    let Some(pnl_pct) = (mark_value - entry_value).checked_div(entry_value.abs()) else {
        return Decimal::ZERO;
    };
    let effective_leverage = qty
        .checked_mul(bankrupt_price)
        .and_then(|bankrupt_value| mark_value.checked_sub(bankrupt_value))
        .filter(|d| *d > Decimal::ZERO)
        .and_then(|d| mark_value.abs().checked_div(d))
        .filter(|l| !l.is_zero());

    match (pnl_pct.cmp(&Decimal::ZERO), effective_leverage) {
        (Ordering::Equal, _) => Decimal::ZERO,
        (_, None) => pnl_pct,
        (Ordering::Greater, Some(lev)) => pnl_pct.checked_mul(lev).unwrap_or(Decimal::MAX),
        (Ordering::Less, Some(lev)) => pnl_pct / lev,
    }
}

pub fn is_bounded(price: Decimal) -> bool {
    price > Decimal::ZERO && price < Decimal::MAX
}

fn clamp_linear(price: Option<Decimal>) -> Decimal {
    match price {
        Some(p) if p > Decimal::ZERO => p,
        _ => Decimal::ZERO,
    }
}

fn clamp_inverse(price: Option<Decimal>) -> Decimal {
    match price {
        Some(p) if p > Decimal::ZERO => p,
        _ => Decimal::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn linear() -> Instrument {
        Instrument::btc_usdt()
    }

    fn inverse() -> Instrument {
        Instrument::btc_usd_inverse()
    }

    fn mark(p: Decimal) -> Price {
        Price::new(p).unwrap()
    }

    #[test]
    fn value_and_entry_price_round_trip() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        let ev = calc.entry_value_delta(dec!(2), dec!(50000));
        assert_eq!(ev, dec!(-100000));
        assert_eq!(calc.entry_price(dec!(2), ev), dec!(50000));

        let inst = inverse();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        let ev = calc.entry_value_delta(dec!(-100), dec!(50000));
        assert_eq!(ev, dec!(-0.2));
        assert_eq!(calc.entry_price(dec!(-100), ev), dec!(50000));
    }

    #[test]
    fn unrealized_pnl_linear_and_inverse() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(55000)));
        assert_eq!(calc.unrealized_pnl(dec!(1), dec!(-50000)), dec!(5000));
        assert_eq!(calc.unrealized_pnl(dec!(-1), dec!(50000)), dec!(-5000));

        let inst = inverse();
        let calc = MarginCalculator::new(&inst, mark(dec!(40000)));
        // short 100 contracts × 100 USD, price fell from 50000 to 40000
        let ev = calc.entry_value_delta(dec!(-100), dec!(50000));
        assert_eq!(calc.unrealized_pnl(dec!(-100), ev), dec!(0.05));
    }

    #[test]
    fn realized_pnl_uses_value_ratio() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(100)));
        // entered 2 @ 100 then 2 @ 120 → avg 110
        let ev = dec!(-200) + dec!(-240);
        assert_eq!(calc.realized_pnl(dec!(4), ev, dec!(1), dec!(130)), dec!(20));
        assert_eq!(calc.realized_pnl(dec!(-4), -ev, dec!(2), dec!(100)), dec!(20));

        let inst = inverse();
        let calc = MarginCalculator::new(&inst, mark(dec!(100)));
        let ev = calc.entry_value_delta(dec!(1), dec!(100));
        let pnl = calc.realized_pnl(dec!(1), ev, dec!(1), dec!(125));
        // 1 × 25 × 100 / (100 × 125)
        assert_eq!(pnl, dec!(0.2));
    }

    #[test]
    fn linear_isolated_liquidation_and_bankrupt_prices() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        let tier = MaintenanceTier::new(dec!(0.005), dec!(0));
        // long 1 @ 50000 with 5000 margin (10x)
        let ev = dec!(-50000);
        assert_eq!(calc.bankrupt_price(dec!(1), ev, dec!(5000)), dec!(45000));
        let liq = calc.liquidation_price(dec!(1), ev, dec!(5000), tier);
        assert_eq!(liq.round_dp(2), dec!(45226.13));

        // short mirrors
        assert_eq!(calc.bankrupt_price(dec!(-1), -ev, dec!(5000)), dec!(55000));
        let liq = calc.liquidation_price(dec!(-1), -ev, dec!(5000), tier);
        assert_eq!(liq.round_dp(2), dec!(54726.37));
    }

    #[test]
    fn unreachable_prices_are_clamped() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        // fully collateralised long never liquidates
        let liq = calc.liquidation_price(dec!(1), dec!(-50000), dec!(60000), MaintenanceTier::default());
        assert_eq!(liq, Decimal::ZERO);

        let inst = inverse();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        // 1x inverse short never goes bankrupt
        let ev = calc.entry_value_delta(dec!(-100), dec!(50000));
        assert_eq!(calc.bankrupt_price(dec!(-100), ev, dec!(0.2)), Decimal::MAX);
    }

    #[test]
    fn inverse_bankrupt_price() {
        let inst = inverse();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        // long 100 contracts @ 50000 at 2x: margin 0.1 BTC
        let ev = calc.entry_value_delta(dec!(100), dec!(50000));
        let margin = calc.open_margin(dec!(100), dec!(50000), dec!(2));
        assert_eq!(margin, dec!(0.1));
        // 10000 / (0.1 + 0.2) = 33333.33
        assert_eq!(calc.bankrupt_price(dec!(100), ev, margin).round_dp(2), dec!(33333.33));
    }

    #[test]
    fn charged_cost_nets_opposite_reservation() {
        assert_eq!(charged_cost(Side::Buy, dec!(10), dec!(0), dec!(0)), dec!(10));
        assert_eq!(charged_cost(Side::Buy, dec!(10), dec!(5), dec!(20)), dec!(0));
        assert_eq!(charged_cost(Side::Buy, dec!(10), dec!(5), dec!(12)), dec!(3));
        assert_eq!(charged_cost(Side::Sell, dec!(10), dec!(20), dec!(30)), dec!(10));
    }

    #[test]
    fn prorate_handles_zero_quantity() {
        assert_eq!(prorate(dec!(100), dec!(1), dec!(4)), dec!(25));
        assert_eq!(prorate(dec!(100), dec!(1), dec!(0)), dec!(0));
    }

    #[test]
    fn prorate_last_release_takes_the_remainder() {
        let first = prorate(dec!(100), dec!(1), dec!(3));
        assert_eq!(first, dec!(100) / dec!(3));
        let left = dec!(100) - first;
        let second = prorate(left, dec!(1), dec!(2));
        let left = left - second;
        assert_eq!(prorate(left, dec!(1), dec!(1)), left);
        assert_eq!(prorate(dec!(7), dec!(5), dec!(4)), dec!(7));
    }

    #[test]
    fn open_size_only_counts_flip() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(100)));
        assert_eq!(calc.open_size(Side::Sell, dec!(3), dec!(2)), dec!(1));
        assert_eq!(calc.open_size(Side::Sell, dec!(1), dec!(2)), dec!(0));
        assert_eq!(calc.open_size(Side::Buy, dec!(3), dec!(2)), dec!(3));
    }

    #[test]
    fn mul_buy_includes_spread_above_mark() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(100)));
        let at_mark = calc.mul_buy(dec!(100), dec!(10));
        let above = calc.mul_buy(dec!(110), dec!(10));
        assert!(above - at_mark > dec!(10));
        // selling above mark carries no spread term
        let sell = calc.mul_sell(dec!(110), dec!(10));
        assert!(sell < above);
    }

    #[test]
    fn funding_fee_sign() {
        let inst = linear();
        let calc = MarginCalculator::new(&inst, mark(dec!(50000)));
        // positive rate: longs pay
        assert_eq!(calc.funding_fee(dec!(1), dec!(0.01)), dec!(-5));
        assert_eq!(calc.funding_fee(dec!(-1), dec!(0.01)), dec!(5));
    }

    #[test]
    fn ranking_orders_profit_by_leverage() {
        // both +10%, the one closer to bankruptcy ranks higher
        let high = pnl_ranking(dec!(1), dec!(100), dec!(110), dec!(95));
        let low = pnl_ranking(dec!(1), dec!(100), dec!(110), dec!(50));
        assert!(high > low);
        assert_eq!(pnl_ranking(dec!(1), dec!(100), dec!(100), dec!(90)), Decimal::ZERO);
        // bankrupt at or above mark: leverage treated as 1
        assert_eq!(pnl_ranking(dec!(1), dec!(100), dec!(90), dec!(95)), dec!(-0.1));
    }
}
