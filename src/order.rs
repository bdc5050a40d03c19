//! Orders and the per-symbol order book.
//!
//! The book only keeps `(order id, remaining)` per resting order, grouped in
//! FIFO queues per price level. Order details live in the order store. Every
//! book edit is journaled so the book follows the same staged/checkpoint/
//! commit protocol as the stores, and the committed journal becomes the
//! order-book delta stream.

use crate::store::Entity;
use crate::types::{AccountId, Leverage, MarginMode, OrderId, Price, Side, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Order time in force options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled. Remains on book until filled or canceled.
    #[default]
    GTC,
    /// Immediate or cancel. Fill what is possible, cancel the rest.
    IOC,
    /// Fill or kill. Fill entirely or cancel entirely.
    FOK,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    /// Executes at the maker's price. Locked to a book price for margin.
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Waiting for its trigger price
    Untriggered,
    /// Accepted, not yet activated
    Pending,
    Active,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpSl {
    TakeProfit,
    StopLoss,
}

/// Tags orders created by the engine itself, plus the reduce-only trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderNote {
    Liquidation,
    InsuranceLiquidation,
    InsuranceFunding,
    AutoDeleverage,
    ReduceOnlyCanceled,
}

impl OrderNote {
    /// Engine orders trade fee-free and skip the balance check.
    pub fn is_system(&self) -> bool {
        !matches!(self, OrderNote::ReduceOnlyCanceled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Price>,
    /// Price the margin reservation was computed at
    pub lock_price: Option<Price>,
    pub quantity: Decimal,
    pub remaining: Decimal,
    pub filled: Decimal,
    pub avg_fill_price: Decimal,
    pub margin_mode: MarginMode,
    pub leverage: Leverage,
    pub reduce_only: bool,
    pub post_only: bool,
    pub trigger_price: Option<Price>,
    pub tp_sl: Option<TpSl>,
    pub note: Option<OrderNote>,
    pub status: OrderStatus,
    /// Raw margin reserved on the position side for this order
    pub reserved: Decimal,
    /// Increase of the position's order cost this order caused
    pub order_cost: Decimal,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    pub fn limit(account_id: AccountId, symbol: impl Into<String>, side: Side, quantity: Decimal, price: Price) -> Self {
        Self::base(account_id, symbol.into(), side, OrderType::Limit, quantity, Some(price))
    }

    pub fn market(account_id: AccountId, symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        let mut order = Self::base(account_id, symbol.into(), side, OrderType::Market, quantity, None);
        order.time_in_force = TimeInForce::IOC;
        order
    }

    fn base(
        account_id: AccountId,
        symbol: String,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Price>,
    ) -> Self {
        Self {
            id: OrderId(0),
            account_id,
            symbol,
            side,
            order_type,
            time_in_force: TimeInForce::GTC,
            price,
            lock_price: None,
            quantity,
            remaining: quantity,
            filled: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            margin_mode: MarginMode::Cross,
            leverage: Leverage::one(),
            reduce_only: false,
            post_only: false,
            trigger_price: None,
            tp_sl: None,
            note: None,
            status: OrderStatus::Pending,
            reserved: Decimal::ZERO,
            order_cost: Decimal::ZERO,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    pub fn with_note(mut self, note: OrderNote) -> Self {
        self.note = Some(note);
        self
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Untriggered | OrderStatus::Pending | OrderStatus::Active)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    pub fn is_system(&self) -> bool {
        self.note.map_or(false, |n| n.is_system())
    }

    /// Price that bounds matching. Market orders are unbounded.
    pub fn limit_price(&self) -> Option<Price> {
        match self.order_type {
            OrderType::Limit => self.price,
            OrderType::Market => None,
        }
    }

    pub fn crosses(&self, maker_price: Price) -> bool {
        match (self.limit_price(), self.side) {
            (None, _) => true,
            (Some(limit), Side::Buy) => limit >= maker_price,
            (Some(limit), Side::Sell) => limit <= maker_price,
        }
    }

    pub fn fill(&mut self, qty: Decimal, price: Decimal) {
        debug_assert!(qty <= self.remaining, "cannot fill more than remaining");
        if qty <= Decimal::ZERO {
            return;
        }
        let notional = self.avg_fill_price * self.filled + price * qty;
        self.filled += qty;
        self.remaining -= qty;
        self.avg_fill_price = notional / self.filled;
        if self.remaining.is_zero() {
            self.status = OrderStatus::Filled;
        }
    }
}

impl Entity for Order {
    type Key = OrderId;

    fn key(&self) -> OrderId {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = OrderId(id);
    }

    fn stamp(&mut self, now: Timestamp, created: bool) {
        if created {
            self.created_at = now;
        }
        self.updated_at = now;
    }

    fn expires_at(&self, ttl_ms: Option<i64>) -> Option<Timestamp> {
        match ttl_ms {
            Some(ttl) if self.is_closed() => Some(self.updated_at.plus_millis(ttl)),
            _ => None,
        }
    }
}

/// Signed quantity change at one price level, emitted on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub symbol: String,
    pub side: Side,
    pub price: Price,
    pub delta: Decimal,
}

/// A single price level in the order book
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Price,
    pub total_size: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BookEntry {
    order_id: OrderId,
    remaining: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BookOp {
    Inserted { side: Side, price: Price, entry: BookEntry },
    Removed { side: Side, price: Price, index: usize, entry: BookEntry },
    Filled { side: Side, price: Price, order_id: OrderId, qty: Decimal },
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    bids: BTreeMap<Price, VecDeque<BookEntry>>,
    asks: BTreeMap<Price, VecDeque<BookEntry>>,
    journal: Vec<BookOp>,
    checkpoint_mark: Option<usize>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            journal: Vec::new(),
            checkpoint_mark: None,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Price, VecDeque<BookEntry>> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Levels of one side from best to worst.
    fn levels(&self, side: Side) -> Box<dyn Iterator<Item = (&Price, &VecDeque<BookEntry>)> + '_> {
        match side {
            Side::Buy => Box::new(self.bids.iter().rev()),
            Side::Sell => Box::new(self.asks.iter()),
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    pub fn best(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    /// Oldest order at the best level of `side`.
    pub fn front(&self, side: Side) -> Option<(OrderId, Price, Decimal)> {
        self.levels(side)
            .next()
            .and_then(|(price, queue)| queue.front().map(|e| (e.order_id, *price, e.remaining)))
    }

    pub fn insert(&mut self, side: Side, price: Price, order_id: OrderId, remaining: Decimal) {
        let entry = BookEntry { order_id, remaining };
        self.side_mut(side).entry(price).or_default().push_back(entry);
        self.journal.push(BookOp::Inserted { side, price, entry });
    }

    pub fn remove(&mut self, side: Side, price: Price, order_id: OrderId) -> bool {
        let levels = self.side_mut(side);
        let Some(queue) = levels.get_mut(&price) else {
            return false;
        };
        let Some(index) = queue.iter().position(|e| e.order_id == order_id) else {
            return false;
        };
        let entry = queue.remove(index);
        if queue.is_empty() {
            levels.remove(&price);
        }
        if let Some(entry) = entry {
            self.journal.push(BookOp::Removed { side, price, index, entry });
        }
        true
    }

    /// Reduce a resting order's size. The entry is removed once nothing remains.
    pub fn fill(&mut self, side: Side, price: Price, order_id: OrderId, qty: Decimal) {
        let Some(queue) = self.side_mut(side).get_mut(&price) else {
            return;
        };
        let Some(entry) = queue.iter_mut().find(|e| e.order_id == order_id) else {
            return;
        };
        let qty = qty.min(entry.remaining);
        entry.remaining -= qty;
        let done = entry.remaining.is_zero();
        self.journal.push(BookOp::Filled { side, price, order_id, qty });
        if done {
            self.remove(side, price, order_id);
        }
    }

    /// Size resting on the side opposite `taker_side` that `limit` can reach.
    pub fn matchable(&self, taker_side: Side, limit: Option<Price>) -> Decimal {
        self.levels(taker_side.opposite())
            .take_while(|(price, _)| reaches(taker_side, limit, **price))
            .flat_map(|(_, queue)| queue.iter())
            .map(|e| e.remaining)
            .sum()
    }

    /// Worst price a market order of `size` would need to fill, or the deepest
    /// level if the book is too thin. `None` on an empty side.
    pub fn lock_price(&self, taker_side: Side, size: Decimal) -> Option<Price> {
        let mut acc = Decimal::ZERO;
        let mut last = None;
        for (price, queue) in self.levels(taker_side.opposite()) {
            last = Some(*price);
            acc += queue.iter().map(|e| e.remaining).sum::<Decimal>();
            if acc >= size {
                break;
            }
        }
        last
    }

    pub fn depth(&self, side: Side, max_levels: usize) -> Vec<PriceLevel> {
        self.levels(side)
            .take(max_levels)
            .map(|(price, queue)| PriceLevel {
                price: *price,
                total_size: queue.iter().map(|e| e.remaining).sum(),
                order_count: queue.len(),
            })
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.bids.values().chain(self.asks.values()).map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn checkpoint(&mut self) {
        self.checkpoint_mark = Some(self.journal.len());
    }

    pub fn rollback_to_checkpoint(&mut self) {
        let mark = self.checkpoint_mark.unwrap_or(0);
        self.undo_to(mark);
    }

    pub fn rollback(&mut self) {
        self.undo_to(0);
        self.checkpoint_mark = None;
    }

    fn undo_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some(op) = self.journal.pop() else {
                break;
            };
            match op {
                BookOp::Inserted { side, price, entry } => {
                    let levels = self.side_mut(side);
                    if let Some(queue) = levels.get_mut(&price) {
                        if let Some(pos) = queue.iter().rposition(|e| e.order_id == entry.order_id) {
                            queue.remove(pos);
                        }
                        if queue.is_empty() {
                            levels.remove(&price);
                        }
                    }
                }
                BookOp::Removed { side, price, index, entry } => {
                    let queue = self.side_mut(side).entry(price).or_default();
                    let index = index.min(queue.len());
                    queue.insert(index, entry);
                }
                BookOp::Filled { side, price, order_id, qty } => {
                    if let Some(entry) = self
                        .side_mut(side)
                        .get_mut(&price)
                        .and_then(|q| q.iter_mut().find(|e| e.order_id == order_id))
                    {
                        entry.remaining += qty;
                    }
                }
            }
        }
    }

    /// Drop the journal and return the net change per level.
    pub fn commit(&mut self) -> Vec<BookDelta> {
        let mut deltas: Vec<BookDelta> = Vec::new();
        for op in self.journal.drain(..) {
            let (side, price, delta) = match op {
                BookOp::Inserted { side, price, entry } => (side, price, entry.remaining),
                BookOp::Removed { side, price, entry, .. } => (side, price, -entry.remaining),
                BookOp::Filled { side, price, qty, .. } => (side, price, -qty),
            };
            match deltas.iter_mut().find(|d| d.side == side && d.price == price) {
                Some(existing) => existing.delta += delta,
                None => deltas.push(BookDelta {
                    symbol: self.symbol.clone(),
                    side,
                    price,
                    delta,
                }),
            }
        }
        self.checkpoint_mark = None;
        deltas.retain(|d| !d.delta.is_zero());
        deltas
    }

    pub fn has_pending(&self) -> bool {
        !self.journal.is_empty()
    }

    #[cfg(test)]
    fn queue_ids(&self, side: Side, price: Price) -> Vec<u64> {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels
            .get(&price)
            .map(|q| q.iter().map(|e| e.order_id.0).collect())
            .unwrap_or_default()
    }
}

fn reaches(taker_side: Side, limit: Option<Price>, maker_price: Price) -> bool {
    match (limit, taker_side) {
        (None, _) => true,
        (Some(limit), Side::Buy) => limit >= maker_price,
        (Some(limit), Side::Sell) => limit <= maker_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn px(p: Decimal) -> Price {
        Price::new(p).unwrap()
    }

    fn book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        book.insert(Side::Buy, px(dec!(100)), OrderId(1), dec!(3));
        book.insert(Side::Buy, px(dec!(100)), OrderId(2), dec!(3));
        book.insert(Side::Buy, px(dec!(99)), OrderId(3), dec!(5));
        book.insert(Side::Sell, px(dec!(101)), OrderId(4), dec!(2));
        book.insert(Side::Sell, px(dec!(103)), OrderId(5), dec!(4));
        book.commit();
        book
    }

    #[test]
    fn price_time_priority() {
        let book = book();
        assert_eq!(book.front(Side::Buy), Some((OrderId(1), px(dec!(100)), dec!(3))));
        assert_eq!(book.front(Side::Sell), Some((OrderId(4), px(dec!(101)), dec!(2))));
        assert_eq!(book.best_bid(), Some(px(dec!(100))));
        assert_eq!(book.best_ask(), Some(px(dec!(101))));
    }

    #[test]
    fn fill_removes_exhausted_entry() {
        let mut book = book();
        book.fill(Side::Buy, px(dec!(100)), OrderId(1), dec!(1));
        assert_eq!(book.front(Side::Buy), Some((OrderId(1), px(dec!(100)), dec!(2))));
        book.fill(Side::Buy, px(dec!(100)), OrderId(1), dec!(2));
        assert_eq!(book.front(Side::Buy), Some((OrderId(2), px(dec!(100)), dec!(3))));
    }

    #[test]
    fn matchable_respects_limit() {
        let book = book();
        assert_eq!(book.matchable(Side::Buy, Some(px(dec!(102)))), dec!(2));
        assert_eq!(book.matchable(Side::Buy, None), dec!(6));
        assert_eq!(book.matchable(Side::Sell, Some(px(dec!(100)))), dec!(6));
    }

    #[test]
    fn lock_price_walks_the_book() {
        let book = book();
        assert_eq!(book.lock_price(Side::Buy, dec!(1)), Some(px(dec!(101))));
        assert_eq!(book.lock_price(Side::Buy, dec!(3)), Some(px(dec!(103))));
        // thin book locks at the deepest level
        assert_eq!(book.lock_price(Side::Buy, dec!(50)), Some(px(dec!(103))));
        assert_eq!(OrderBook::new("X").lock_price(Side::Sell, dec!(1)), None);
    }

    #[test]
    fn rollback_restores_queue_order() {
        let mut book = book();
        book.fill(Side::Buy, px(dec!(100)), OrderId(1), dec!(3));
        book.remove(Side::Buy, px(dec!(99)), OrderId(3));
        book.insert(Side::Buy, px(dec!(100)), OrderId(9), dec!(1));
        book.rollback();

        assert_eq!(book.queue_ids(Side::Buy, px(dec!(100))), vec![1, 2]);
        assert_eq!(book.queue_ids(Side::Buy, px(dec!(99))), vec![3]);
        assert_eq!(book.front(Side::Buy), Some((OrderId(1), px(dec!(100)), dec!(3))));
        assert!(book.commit().is_empty());
    }

    #[test]
    fn rollback_to_checkpoint_keeps_earlier_edits() {
        let mut book = book();
        book.fill(Side::Sell, px(dec!(101)), OrderId(4), dec!(1));
        book.checkpoint();
        book.fill(Side::Sell, px(dec!(101)), OrderId(4), dec!(1));
        book.rollback_to_checkpoint();

        assert_eq!(book.front(Side::Sell), Some((OrderId(4), px(dec!(101)), dec!(1))));
        let deltas = book.commit();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].delta, dec!(-1));
    }

    #[test]
    fn commit_aggregates_deltas_by_level() {
        let mut book = book();
        book.fill(Side::Buy, px(dec!(100)), OrderId(1), dec!(3));
        book.fill(Side::Buy, px(dec!(100)), OrderId(2), dec!(1));
        book.insert(Side::Sell, px(dec!(102)), OrderId(6), dec!(2));
        book.insert(Side::Sell, px(dec!(105)), OrderId(7), dec!(1));
        book.remove(Side::Sell, px(dec!(105)), OrderId(7));

        let deltas = book.commit();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].price, px(dec!(100)));
        assert_eq!(deltas[0].delta, dec!(-4));
        assert_eq!(deltas[1].side, Side::Sell);
        assert_eq!(deltas[1].delta, dec!(2));
        assert!(!book.has_pending());
    }

    #[test]
    fn closed_orders_expire() {
        let mut order = Order::limit(AccountId(1), "BTCUSDT", Side::Buy, dec!(1), px(dec!(100)));
        assert_eq!(order.expires_at(Some(1_000)), None);
        order.fill(dec!(1), dec!(100));
        order.updated_at = Timestamp::from_millis(5);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.expires_at(Some(1_000)), Some(Timestamp::from_millis(1_005)));
    }
}
