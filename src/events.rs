// 11.0: what a command produces. everything committed while the command ran is
// collected here: final copies of the touched orders, new trades, wallet
// transactions, margin history rows and the net order-book deltas.

use crate::history::{MarginHistory, Trade, Transaction};
use crate::liquidation::LiquidationStage;
use crate::order::{BookDelta, Order};
use crate::types::{PositionKey, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub orders: Vec<Order>,
    pub trades: Vec<Trade>,
    pub transactions: Vec<Transaction>,
    pub margin_histories: Vec<MarginHistory>,
    pub book_deltas: Vec<BookDelta>,
    pub failed_liquidations: Vec<FailedLiquidation>,
    /// Set when the reserved id pool fell to its low-water mark
    pub reserved_ids_low: bool,
}

impl CommandOutput {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
            && self.trades.is_empty()
            && self.transactions.is_empty()
            && self.margin_histories.is_empty()
            && self.book_deltas.is_empty()
            && self.failed_liquidations.is_empty()
    }

    /// Fold a later commit of the same command into this one. An order
    /// touched twice keeps its latest copy.
    pub fn merge(&mut self, later: CommandOutput) {
        for order in later.orders {
            match self.orders.iter_mut().find(|o| o.id == order.id) {
                Some(existing) => *existing = order,
                None => self.orders.push(order),
            }
        }
        self.trades.extend(later.trades);
        self.transactions.extend(later.transactions);
        self.margin_histories.extend(later.margin_histories);
        for delta in later.book_deltas {
            match self
                .book_deltas
                .iter_mut()
                .find(|d| d.symbol == delta.symbol && d.side == delta.side && d.price == delta.price)
            {
                Some(existing) => existing.delta += delta.delta,
                None => self.book_deltas.push(delta),
            }
        }
        self.book_deltas.retain(|d| !d.delta.is_zero());
        self.failed_liquidations.extend(later.failed_liquidations);
        self.reserved_ids_low |= later.reserved_ids_low;
    }
}

/// A liquidation unit that was rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedLiquidation {
    pub position: PositionKey,
    pub stage: LiquidationStage,
    pub reason: String,
    pub at: Timestamp,
}
