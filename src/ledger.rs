// 2.0: the ledger. one EntityStore per aggregate, the per-symbol books, the
// adl ranking index and the reserved id pool, all committed or rolled back
// together.
//
// secondary indexes are append-only supersets: an entry may point at a key a
// rollback made disappear, so every lookup resolves through the store and
// skips misses. the reaper prunes them.

use crate::account::Account;
use crate::engine::EngineConfig;
use crate::events::CommandOutput;
use crate::history::{FundingHistory, MarginHistory, PositionHistory, Trade, Transaction};
use crate::order::{Order, OrderBook};
use crate::position::Position;
use crate::ranking::PnlRankingIndex;
use crate::store::{EntityStore, IdPool, StoreError};
use crate::types::{AccountId, HistoryId, OrderId, PositionId, PositionKey, Timestamp, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Last ids handed out by a previous run, one per sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSeeds {
    pub account: u64,
    pub position: u64,
    pub order: u64,
    pub trade: u64,
    pub transaction: u64,
    /// Shared by margin, position and funding history
    pub history: u64,
}

#[derive(Debug)]
pub struct Ledger {
    accounts: EntityStore<Account>,
    positions: EntityStore<Position>,
    orders: EntityStore<Order>,
    trades: EntityStore<Trade>,
    transactions: EntityStore<Transaction>,
    margin_history: EntityStore<MarginHistory>,
    position_history: EntityStore<PositionHistory>,
    funding_history: EntityStore<FundingHistory>,
    books: BTreeMap<String, OrderBook>,
    ranking: PnlRankingIndex,
    reserved: IdPool,
    unranked_users: BTreeSet<UserId>,

    user_accounts: HashMap<(UserId, String), AccountId>,
    account_positions: HashMap<AccountId, BTreeSet<PositionKey>>,
    symbol_positions: HashMap<String, BTreeSet<PositionKey>>,
    account_orders: HashMap<AccountId, BTreeSet<OrderId>>,
    position_histories: HashMap<PositionId, Vec<HistoryId>>,
    tx_hashes: HashMap<String, TransactionId>,
    // hashes of reaped transactions still count as seen
    retired_hashes: HashSet<String>,
}

impl Ledger {
    pub fn new(config: &EngineConfig) -> Self {
        let history_ttl = config.history_ttl_ms;
        Self {
            accounts: EntityStore::new("account"),
            positions: EntityStore::new("position"),
            orders: EntityStore::new("order").with_ttl(config.closed_order_ttl_ms),
            trades: EntityStore::new("trade").with_ttl(history_ttl),
            transactions: EntityStore::new("transaction").with_ttl(history_ttl),
            margin_history: EntityStore::new("margin_history").with_ttl(history_ttl),
            position_history: EntityStore::new("position_history").with_ttl(history_ttl),
            funding_history: EntityStore::new("funding_history").with_ttl(history_ttl),
            books: BTreeMap::new(),
            ranking: PnlRankingIndex::new(),
            reserved: IdPool::new(config.reserved_pool_capacity, config.reserved_pool_low_watermark),
            unranked_users: config
                .insurance_users
                .values()
                .copied()
                .chain(config.bot_users.iter().copied())
                .collect(),
            user_accounts: HashMap::new(),
            account_positions: HashMap::new(),
            symbol_positions: HashMap::new(),
            account_orders: HashMap::new(),
            position_histories: HashMap::new(),
            tx_hashes: HashMap::new(),
            retired_hashes: HashSet::new(),
        }
    }

    pub fn initialize(&mut self, seeds: IdSeeds) {
        self.accounts.initialize(seeds.account);
        self.positions.initialize(seeds.position);
        self.orders.initialize(seeds.order);
        self.trades.initialize(seeds.trade);
        self.transactions.initialize(seeds.transaction);
        self.margin_history.initialize(seeds.history);
        self.position_history.initialize(seeds.history);
        self.funding_history.initialize(seeds.history);
    }

    pub fn is_initialized(&self) -> bool {
        self.accounts.is_initialized()
            && self.positions.is_initialized()
            && self.orders.is_initialized()
            && self.trades.is_initialized()
            && self.transactions.is_initialized()
            && self.margin_history.is_initialized()
    }

    // 2.1: accounts

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id)
    }

    pub fn account_for(&self, user_id: UserId, asset: &str) -> Option<Account> {
        self.user_accounts
            .get(&(user_id, asset.to_string()))
            .and_then(|id| self.accounts.get(id))
    }

    pub fn insert_account(&mut self, account: Account, now: Timestamp) -> Result<Account, StoreError> {
        let account = self.accounts.insert(account, now)?;
        self.user_accounts
            .insert((account.user_id, account.asset.clone()), account.id);
        Ok(account)
    }

    pub fn save_account(&mut self, account: Account, now: Timestamp) -> Account {
        self.accounts.update(account, now)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.values()
    }

    // 2.2: positions

    pub fn position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.get(key)
    }

    pub fn positions_of_account(&self, account_id: AccountId) -> Vec<Position> {
        self.account_positions
            .get(&account_id)
            .into_iter()
            .flatten()
            .filter_map(|k| self.positions.get(k))
            .collect()
    }

    /// Positions of a symbol in position-id order.
    pub fn positions_of_symbol(&self, symbol: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .symbol_positions
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|k| self.positions.get(k))
            .collect();
        positions.sort_by_key(|p| p.id);
        positions
    }

    pub fn insert_position(&mut self, position: Position, now: Timestamp) -> Result<Position, StoreError> {
        let position = self.positions.insert(position, now)?;
        let key = position.key();
        self.account_positions
            .entry(position.account_id)
            .or_default()
            .insert(key.clone());
        self.symbol_positions
            .entry(position.symbol.clone())
            .or_default()
            .insert(key);
        self.rank(&position);
        Ok(position)
    }

    /// Stage a position write and re-file it in the ranking index.
    pub fn save_position(&mut self, position: Position, now: Timestamp) -> Position {
        let position = self.positions.update(position, now);
        self.rank(&position);
        position
    }

    fn rank(&mut self, position: &Position) {
        let exempt = self
            .accounts
            .peek(&position.account_id)
            .map_or(false, |a| self.unranked_users.contains(&a.user_id));
        if exempt {
            self.ranking.remove(&position.key());
        } else {
            self.ranking.update(position);
        }
    }

    pub fn ranking(&self) -> &PnlRankingIndex {
        &self.ranking
    }

    pub fn ranking_mut(&mut self) -> &mut PnlRankingIndex {
        &mut self.ranking
    }

    // 2.3: orders and books

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.orders.get(&id)
    }

    /// Open orders of an account, oldest first.
    pub fn open_orders_of_account(&self, account_id: AccountId) -> Vec<Order> {
        self.account_orders
            .get(&account_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.is_open())
            .collect()
    }

    pub fn insert_order(&mut self, order: Order, now: Timestamp) -> Result<Order, StoreError> {
        let order = self.orders.insert(order, now)?;
        self.index_order(&order);
        Ok(order)
    }

    /// Insert an engine order under an id from the reserved pool.
    pub fn insert_reserved_order(&mut self, order: Order, now: Timestamp) -> Result<Order, StoreError> {
        let id = self.reserved.draw()?;
        let order = self.orders.insert_with_id(order, id, now)?;
        self.index_order(&order);
        Ok(order)
    }

    fn index_order(&mut self, order: &Order) {
        self.account_orders
            .entry(order.account_id)
            .or_default()
            .insert(order.id);
    }

    pub fn save_order(&mut self, order: Order, now: Timestamp) -> Order {
        self.orders.update(order, now)
    }

    /// Open orders as of the last commit. Staged writes are invisible here.
    pub fn committed_orders(&self) -> impl Iterator<Item = Order> + '_ {
        self.account_orders
            .values()
            .flatten()
            .filter_map(|id| self.orders.get_committed(id))
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    pub fn book_mut(&mut self, symbol: &str) -> &mut OrderBook {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| OrderBook::new(symbol))
    }

    pub fn refill_reserved(&mut self, ids: impl IntoIterator<Item = u64>) -> usize {
        self.reserved.refill(ids)
    }

    pub fn reserved_remaining(&self) -> usize {
        self.reserved.remaining()
    }

    // 2.4: append-only records

    pub fn insert_trade(&mut self, trade: Trade, now: Timestamp) -> Result<Trade, StoreError> {
        self.trades.insert(trade, now)
    }

    pub fn insert_transaction(&mut self, tx: Transaction, now: Timestamp) -> Result<Transaction, StoreError> {
        let tx = self.transactions.insert(tx, now)?;
        if let Some(hash) = &tx.hash {
            self.tx_hashes.insert(hash.clone(), tx.id);
        }
        Ok(tx)
    }

    pub fn is_duplicate_hash(&self, hash: &str) -> bool {
        self.retired_hashes.contains(hash)
            || self
                .tx_hashes
                .get(hash)
                .map_or(false, |id| self.transactions.contains(id))
    }

    pub fn insert_margin_history(&mut self, row: MarginHistory, now: Timestamp) -> Result<MarginHistory, StoreError> {
        self.margin_history.insert(row, now)
    }

    pub fn insert_position_history(&mut self, row: PositionHistory, now: Timestamp) -> Result<PositionHistory, StoreError> {
        let row = self.position_history.insert(row, now)?;
        self.position_histories
            .entry(row.position_id)
            .or_default()
            .push(row.id);
        Ok(row)
    }

    pub fn position_history_of(&self, position_id: PositionId) -> Vec<PositionHistory> {
        self.position_histories
            .get(&position_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.position_history.get(id))
            .collect()
    }

    pub fn insert_funding_history(&mut self, row: FundingHistory, now: Timestamp) -> Result<FundingHistory, StoreError> {
        self.funding_history.insert(row, now)
    }

    pub fn funding_history(&self) -> Vec<FundingHistory> {
        self.funding_history.values()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.values()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.values()
    }

    // 2.5: transaction protocol

    pub fn has_pending(&self) -> bool {
        self.accounts.has_pending()
            || self.positions.has_pending()
            || self.orders.has_pending()
            || self.trades.has_pending()
            || self.transactions.has_pending()
            || self.margin_history.has_pending()
            || self.position_history.has_pending()
            || self.funding_history.has_pending()
            || self.books.values().any(|b| b.has_pending())
    }

    pub fn checkpoint(&mut self) {
        self.accounts.checkpoint();
        self.positions.checkpoint();
        self.orders.checkpoint();
        self.trades.checkpoint();
        self.transactions.checkpoint();
        self.margin_history.checkpoint();
        self.position_history.checkpoint();
        self.funding_history.checkpoint();
        for book in self.books.values_mut() {
            book.checkpoint();
        }
    }

    pub fn rollback_to_checkpoint(&mut self) {
        self.accounts.rollback_to_checkpoint();
        self.positions.rollback_to_checkpoint();
        self.orders.rollback_to_checkpoint();
        self.trades.rollback_to_checkpoint();
        self.transactions.rollback_to_checkpoint();
        self.margin_history.rollback_to_checkpoint();
        self.position_history.rollback_to_checkpoint();
        self.funding_history.rollback_to_checkpoint();
        for book in self.books.values_mut() {
            book.rollback_to_checkpoint();
        }
        // touched keys stay until the final commit or rollback
        self.resync_ranking();
    }

    pub fn rollback(&mut self) {
        self.accounts.rollback();
        self.positions.rollback();
        self.orders.rollback();
        self.trades.rollback();
        self.transactions.rollback();
        self.margin_history.rollback();
        self.position_history.rollback();
        self.funding_history.rollback();
        for book in self.books.values_mut() {
            book.rollback();
        }
        self.resync_ranking();
        self.ranking.commit();
    }

    fn resync_ranking(&mut self) {
        for key in self.ranking.touched() {
            match self.positions.get(&key) {
                Some(position) => self.rank(&position),
                None => self.ranking.remove(&key),
            }
        }
    }

    /// Make every staged write durable and describe what changed.
    pub fn commit(&mut self) -> CommandOutput {
        let mut output = CommandOutput::default();

        self.accounts.commit();
        self.positions.commit();
        for id in self.orders.commit() {
            if let Some(order) = self.orders.get_committed(&id) {
                if order.is_closed() {
                    if let Some(ids) = self.account_orders.get_mut(&order.account_id) {
                        ids.remove(&order.id);
                    }
                }
                output.orders.push(order);
            }
        }
        output.trades = self
            .trades
            .commit()
            .iter()
            .filter_map(|id| self.trades.get_committed(id))
            .collect();
        output.transactions = self
            .transactions
            .commit()
            .iter()
            .filter_map(|id| self.transactions.get_committed(id))
            .collect();
        output.margin_histories = self
            .margin_history
            .commit()
            .iter()
            .filter_map(|id| self.margin_history.get_committed(id))
            .collect();
        self.position_history.commit();
        self.funding_history.commit();
        for book in self.books.values_mut() {
            output.book_deltas.extend(book.commit());
        }
        self.ranking.commit();
        output.reserved_ids_low = self.reserved.needs_refill();
        output
    }

    /// Evict expired rows and prune the indexes that pointed at them.
    pub fn reap(&mut self, now: Timestamp) -> usize {
        let orders: HashSet<OrderId> = self.orders.reap(now).into_iter().collect();
        if !orders.is_empty() {
            for ids in self.account_orders.values_mut() {
                ids.retain(|id| !orders.contains(id));
            }
        }

        let txs: HashSet<TransactionId> = self.transactions.reap(now).into_iter().collect();
        if !txs.is_empty() {
            let retired = &mut self.retired_hashes;
            self.tx_hashes.retain(|hash, id| {
                if txs.contains(id) {
                    retired.insert(hash.clone());
                    false
                } else {
                    true
                }
            });
        }

        let histories: HashSet<HistoryId> = self.position_history.reap(now).into_iter().collect();
        if !histories.is_empty() {
            for ids in self.position_histories.values_mut() {
                ids.retain(|id| !histories.contains(id));
            }
            self.position_histories.retain(|_, ids| !ids.is_empty());
        }

        orders.len()
            + txs.len()
            + histories.len()
            + self.trades.reap(now).len()
            + self.margin_history.reap(now).len()
            + self.funding_history.reap(now).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TransactionKind;
    use crate::types::{Leverage, MarginMode, Price, Side};
    use rust_decimal_macros::dec;

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new(&EngineConfig::default());
        ledger.initialize(IdSeeds::default());
        ledger
    }

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn user_asset_index_resolves_through_store() {
        let mut ledger = ledger();
        let account = ledger.insert_account(Account::new(UserId(5), "USDT"), ts(1)).unwrap();
        assert_eq!(ledger.account_for(UserId(5), "USDT").map(|a| a.id), Some(account.id));

        // a rolled back account leaves a dangling index entry that resolves to nothing
        ledger.rollback();
        assert!(ledger.account_for(UserId(5), "USDT").is_none());
    }

    #[test]
    fn commit_reports_orders_trades_and_book_deltas() {
        let mut ledger = ledger();
        let order = Order::limit(AccountId(1), "BTCUSDT", Side::Buy, dec!(2), Price::new(dec!(100)).unwrap());
        let order = ledger.insert_order(order, ts(1)).unwrap();
        ledger
            .book_mut("BTCUSDT")
            .insert(Side::Buy, Price::new(dec!(100)).unwrap(), order.id, dec!(2));
        let tx = Transaction::new(AccountId(1), "USDT", dec!(10), TransactionKind::Deposit);
        ledger.insert_transaction(tx, ts(1)).unwrap();

        let output = ledger.commit();
        assert_eq!(output.orders.len(), 1);
        assert_eq!(output.transactions.len(), 1);
        assert_eq!(output.book_deltas.len(), 1);
        assert_eq!(output.book_deltas[0].delta, dec!(2));
        assert!(!ledger.has_pending());
        assert!(ledger.commit().is_empty());
    }

    #[test]
    fn rollback_resyncs_ranking() {
        let mut ledger = ledger();
        let mut position = Position::new(AccountId(1), "BTCUSDT", "USDT", MarginMode::Cross, Leverage::one());
        position.current_qty = dec!(1);
        position.pnl_ranking = dec!(0.5);
        let position = ledger.insert_position(position, ts(1)).unwrap();
        ledger.commit();

        let polled = ledger.ranking_mut().poll("BTCUSDT", crate::types::PositionSide::Long);
        assert_eq!(polled.map(|(a, _)| a), Some(AccountId(1)));
        let mut flat = position.clone();
        flat.current_qty = dec!(0);
        ledger.save_position(flat, ts(2));

        ledger.rollback();
        assert_eq!(
            ledger.ranking().peek("BTCUSDT", crate::types::PositionSide::Long),
            Some((AccountId(1), dec!(0.5)))
        );
    }

    #[test]
    fn duplicate_hash_survives_reaping() {
        let mut ledger = ledger();
        let tx = Transaction::new(AccountId(1), "USDT", dec!(10), TransactionKind::Deposit).with_hash(Some("0xabc".into()));
        ledger.insert_transaction(tx, ts(0)).unwrap();
        assert!(ledger.is_duplicate_hash("0xabc"));
        ledger.commit();

        let day = EngineConfig::default().history_ttl_ms;
        assert_eq!(ledger.reap(ts(day + 1)), 1);
        assert!(ledger.transactions().is_empty());
        assert!(ledger.is_duplicate_hash("0xabc"));
        assert!(!ledger.is_duplicate_hash("0xdef"));
    }

    #[test]
    fn reserved_orders_draw_from_pool() {
        let mut ledger = ledger();
        let order = Order::market(AccountId(1), "BTCUSDT", Side::Sell, dec!(1));
        assert_eq!(
            ledger.insert_reserved_order(order.clone(), ts(1)).unwrap_err(),
            StoreError::ReservedIdsExhausted
        );
        ledger.refill_reserved(900_000..900_002);
        let placed = ledger.insert_reserved_order(order, ts(1)).unwrap();
        assert_eq!(placed.id, OrderId(900_000));
        // one id left, at or below the low-water mark
        assert!(ledger.commit().reserved_ids_low);
    }

    #[test]
    fn closed_orders_leave_the_account_index() {
        let mut ledger = ledger();
        let order = Order::limit(AccountId(3), "BTCUSDT", Side::Sell, dec!(1), Price::new(dec!(100)).unwrap());
        let mut order = ledger.insert_order(order, ts(1)).unwrap();
        ledger.commit();
        assert_eq!(ledger.open_orders_of_account(AccountId(3)).len(), 1);

        order.status = crate::order::OrderStatus::Canceled;
        ledger.save_order(order, ts(2));
        ledger.commit();
        assert!(ledger.open_orders_of_account(AccountId(3)).is_empty());
    }
}
