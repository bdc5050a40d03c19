// 5.0: append-only records. trades, wallet transactions and the three history
// tables. all of them expire after the history ttl once committed.

use crate::order::OrderNote;
use crate::store::Entity;
use crate::types::{AccountId, HistoryId, Leverage, OrderId, PositionId, Price, Side, Timestamp, TradeId, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One match between a taker and a maker order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: String,
    pub price: Price,
    pub qty: Decimal,
    pub taker_side: Side,
    pub taker_order_id: OrderId,
    pub maker_order_id: OrderId,
    pub taker_account_id: AccountId,
    pub maker_account_id: AccountId,
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    pub taker_realized_pnl: Decimal,
    pub maker_realized_pnl: Decimal,
    pub note: Option<OrderNote>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Funding,
    ClearanceFee,
    InsuranceSweep,
    ShortfallCover,
}

/// Signed wallet movement. Paired kinds (fees, sweeps, shortfall cover) are
/// written as one debit and one credit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub asset: String,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub hash: Option<String>,
    pub created_at: Timestamp,
}

impl Transaction {
    pub fn new(account_id: AccountId, asset: impl Into<String>, amount: Decimal, kind: TransactionKind) -> Self {
        Self {
            id: TransactionId(0),
            account_id,
            asset: asset.into(),
            amount,
            kind,
            hash: None,
            created_at: Timestamp::default(),
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.hash = hash;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginChange {
    AdjustMargin,
    AdjustLeverage,
    Trade,
    LiquidationSweep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginHistory {
    pub id: HistoryId,
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub symbol: String,
    pub kind: MarginChange,
    pub amount: Decimal,
    pub margin_after: Decimal,
    pub leverage: Leverage,
    pub created_at: Timestamp,
}

/// Quantity snapshot taken after every trade-driven position change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionHistory {
    pub id: HistoryId,
    pub position_id: PositionId,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingHistory {
    pub id: HistoryId,
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub symbol: String,
    pub qty: Decimal,
    pub rate: Decimal,
    pub mark_price: Price,
    pub fee: Decimal,
    pub funding_time: Timestamp,
    pub created_at: Timestamp,
}

macro_rules! append_only_entity {
    ($ty:ty, $key:ty, $ctor:expr) => {
        impl Entity for $ty {
            type Key = $key;

            fn key(&self) -> $key {
                self.id
            }

            fn assign_id(&mut self, id: u64) {
                self.id = $ctor(id);
            }

            fn stamp(&mut self, now: Timestamp, created: bool) {
                if created {
                    self.created_at = now;
                }
            }

            fn expires_at(&self, ttl_ms: Option<i64>) -> Option<Timestamp> {
                ttl_ms.map(|ttl| self.created_at.plus_millis(ttl))
            }
        }
    };
}

append_only_entity!(Trade, TradeId, TradeId);
append_only_entity!(Transaction, TransactionId, TransactionId);
append_only_entity!(MarginHistory, HistoryId, HistoryId);
append_only_entity!(PositionHistory, HistoryId, HistoryId);
append_only_entity!(FundingHistory, HistoryId, HistoryId);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use rust_decimal_macros::dec;

    #[test]
    fn history_rows_expire_after_ttl() {
        let mut store: EntityStore<Transaction> = EntityStore::new("transactions").with_ttl(86_400_000);
        store.initialize(0);
        let tx = Transaction::new(AccountId(1), "USDT", dec!(10), TransactionKind::Deposit);
        let tx = store.insert(tx, Timestamp::from_millis(1_000)).unwrap();
        store.commit();

        assert!(store.reap(Timestamp::from_millis(86_400_999)).is_empty());
        assert_eq!(store.reap(Timestamp::from_millis(86_401_000)), vec![tx.id]);
    }

    #[test]
    fn update_keeps_creation_time() {
        let mut row = PositionHistory {
            id: HistoryId(0),
            position_id: PositionId(1),
            qty: dec!(1),
            entry_price: dec!(100),
            created_at: Timestamp::default(),
        };
        row.stamp(Timestamp::from_millis(10), true);
        row.stamp(Timestamp::from_millis(20), false);
        assert_eq!(row.created_at, Timestamp::from_millis(10));
    }
}
