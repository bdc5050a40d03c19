// 6.0: funding settlement helpers. the fee itself is MarginCalculator::funding_fee;
// this module resolves the quantity a position held at the funding timestamp.

use crate::history::PositionHistory;
use crate::types::{Price, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// 6.1: the last snapshot at or before `time` wins. positions with no snapshot
// that old (opened after funding time, or history already reaped) fall back to
// the current quantity.
pub fn qty_at_time<'a>(
    history: impl IntoIterator<Item = &'a PositionHistory>,
    time: Timestamp,
    current_qty: Decimal,
) -> Decimal {
    history
        .into_iter()
        .filter(|h| h.created_at <= time)
        .max_by_key(|h| (h.created_at, h.id))
        .map(|h| h.qty)
        .unwrap_or(current_qty)
}

/// Totals of one funding run, for logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingSummary {
    pub symbol: String,
    pub rate: Decimal,
    pub mark_price: Option<Price>,
    pub positions_charged: usize,
    pub total_paid: Decimal,
    pub total_received: Decimal,
}

impl FundingSummary {
    pub fn record(&mut self, fee: Decimal) {
        self.positions_charged += 1;
        if fee < Decimal::ZERO {
            self.total_paid -= fee;
        } else {
            self.total_received += fee;
        }
    }
}
