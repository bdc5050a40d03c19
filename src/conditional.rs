//! Conditional orders: stops, take-profit and stop-loss.
//!
//! Conditional orders live in the order store with status `Untriggered` and
//! hold no margin until triggered. The trigger scan itself runs outside the
//! engine against committed state; it only needs [`is_triggered`].
//!
//! TP/SL orders are reduce-only and always sized to the current position.

use crate::order::{Order, OrderStatus, TpSl};
use crate::types::{Price, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the trigger price should be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Triggers when price crosses above the trigger.
    Above,
    /// Triggers when price crosses below the trigger.
    Below,
}

/// Direction a conditional order fires in.
///
/// A plain stop buys on a rally and sells on a drop, and a stop-loss is a
/// stop on the closing side. A take-profit fires the other way: a sell
/// take-profit closes a long once price is above the trigger.
pub fn trigger_condition(order: &Order) -> TriggerCondition {
    match (order.tp_sl, order.side) {
        (Some(TpSl::TakeProfit), Side::Sell) => TriggerCondition::Above,
        (Some(TpSl::TakeProfit), Side::Buy) => TriggerCondition::Below,
        (_, Side::Buy) => TriggerCondition::Above,
        (_, Side::Sell) => TriggerCondition::Below,
    }
}

pub fn is_triggered(order: &Order, last_price: Price) -> bool {
    if order.status != OrderStatus::Untriggered {
        return false;
    }
    let Some(trigger) = order.trigger_price else {
        return false;
    };
    match trigger_condition(order) {
        TriggerCondition::Above => last_price >= trigger,
        TriggerCondition::Below => last_price <= trigger,
    }
}

/// A reduce-only order can only stay open on the side that closes the
/// position, so a flat position or a flip leaves it stale.
pub fn reduce_only_conflicts(order: &Order, position_qty: Decimal) -> bool {
    (order.reduce_only || order.tp_sl.is_some()) && Side::closing(position_qty) != Some(order.side)
}

/// Quantity a reduce-only order may still match.
pub fn reducible_quantity(order: &Order, position_qty: Decimal) -> Decimal {
    if Side::closing(position_qty) == Some(order.side) {
        order.remaining.min(position_qty.abs())
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountId;
    use rust_decimal_macros::dec;

    fn px(p: Decimal) -> Price {
        Price::new(p).unwrap()
    }

    fn conditional(side: Side, trigger: Decimal, tp_sl: Option<TpSl>) -> Order {
        let mut order = Order::market(AccountId(1), "BTCUSDT", side, dec!(1));
        order.trigger_price = Some(px(trigger));
        order.tp_sl = tp_sl;
        order.reduce_only = tp_sl.is_some();
        order.status = OrderStatus::Untriggered;
        order
    }

    #[test]
    fn stop_orders_follow_side() {
        let buy_stop = conditional(Side::Buy, dec!(110), None);
        assert!(!is_triggered(&buy_stop, px(dec!(109))));
        assert!(is_triggered(&buy_stop, px(dec!(110))));

        let sell_stop = conditional(Side::Sell, dec!(90), None);
        assert!(is_triggered(&sell_stop, px(dec!(89))));
        assert!(!is_triggered(&sell_stop, px(dec!(95))));
    }

    #[test]
    fn take_profit_and_stop_loss_on_long() {
        // long position closes with sells
        let tp = conditional(Side::Sell, dec!(120), Some(TpSl::TakeProfit));
        let sl = conditional(Side::Sell, dec!(90), Some(TpSl::StopLoss));
        assert!(is_triggered(&tp, px(dec!(121))));
        assert!(!is_triggered(&sl, px(dec!(121))));
        assert!(is_triggered(&sl, px(dec!(85))));
        assert!(!is_triggered(&tp, px(dec!(85))));
    }

    #[test]
    fn active_orders_never_trigger() {
        let mut order = conditional(Side::Buy, dec!(110), None);
        order.status = OrderStatus::Active;
        assert!(!is_triggered(&order, px(dec!(200))));
    }

    #[test]
    fn reduce_only_conflicts_after_flip() {
        let tp = conditional(Side::Sell, dec!(120), Some(TpSl::TakeProfit));
        assert!(!reduce_only_conflicts(&tp, dec!(2)));
        assert!(reduce_only_conflicts(&tp, dec!(-2)));
        assert!(reduce_only_conflicts(&tp, Decimal::ZERO));

        let mut order = Order::market(AccountId(1), "BTCUSDT", Side::Sell, dec!(5));
        order.reduce_only = true;
        assert_eq!(reducible_quantity(&order, dec!(2)), dec!(2));
        assert_eq!(reducible_quantity(&order, dec!(-2)), Decimal::ZERO);
    }
}
