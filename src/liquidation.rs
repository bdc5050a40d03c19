//! Liquidation state and decision helpers.
//!
//! A liquidating position walks `Normal → Liquidating → Normal`. The steps in
//! between (cancel orders, insurance close, ADL, finalize) are driven from
//! `engine/liquidations.rs`; this module holds the pure parts: the
//! liquidability predicate and the clearance fee.

use crate::margin::MarginCalculator;
use crate::position::Position;
use crate::types::PositionSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LiquidationProgress {
    #[default]
    Normal,
    Liquidating,
}

/// Stage reached by a liquidation, for logs and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationStage {
    CancelOrders,
    MarketClose,
    Insurance,
    AutoDeleverage,
    Finalize,
}

impl fmt::Display for LiquidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiquidationStage::CancelOrders => "cancel-orders",
            LiquidationStage::MarketClose => "market-close",
            LiquidationStage::Insurance => "insurance",
            LiquidationStage::AutoDeleverage => "adl",
            LiquidationStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Whether `position` must be liquidated at `mark`. Insurance and bot
/// accounts are passed in as `exempt` and never qualify.
pub fn is_liquidable(position: &Position, mark: Decimal, exempt: bool) -> bool {
    if exempt || position.is_empty() || position.is_liquidating() {
        return false;
    }
    if position.is_isolated() {
        let allocated = position.position_margin + position.adjust_margin;
        if position.maintenance_margin > Decimal::ZERO && allocated <= position.maintenance_margin {
            return true;
        }
    }
    match position.side() {
        Some(PositionSide::Long) => mark <= position.liquidation_price,
        Some(PositionSide::Short) => mark >= position.liquidation_price,
        None => false,
    }
}

/// Clearance fee for closing `qty` at the bankrupt price.
pub fn clearance_fee(calc: &MarginCalculator<'_>, qty: Decimal, bankrupt_price: Decimal, rate: Decimal) -> Decimal {
    calc.fee(qty, bankrupt_price, rate)
}

/// Split `fee` into the part the account can pay and the part that is dropped.
pub fn cap_fee(fee: Decimal, available: Decimal) -> (Decimal, Decimal) {
    let payable = fee.min(available.max(Decimal::ZERO)).max(Decimal::ZERO);
    (payable, fee - payable)
}
