//! PnL ranking index used to pick auto-deleverage counterparties.
//!
//! One indexed max-heap per (symbol, side). Entries are addressed by account
//! through a key → slot map, so a position whose ranking drifted can still be
//! removed in O(log n) without searching for its old rank.

use crate::position::Position;
use crate::types::{AccountId, PositionKey, PositionSide};
use rust_decimal::Decimal;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Binary max-heap with removal by key.
#[derive(Debug, Clone)]
pub struct IndexedHeap<K, P> {
    heap: Vec<(K, P)>,
    slots: HashMap<K, usize>,
}

impl<K: Clone + Eq + Hash, P: Ord> Default for IndexedHeap<K, P> {
    fn default() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash, P: Ord> IndexedHeap<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn priority(&self, key: &K) -> Option<&P> {
        self.slots.get(key).map(|&i| &self.heap[i].1)
    }

    pub fn peek(&self) -> Option<(&K, &P)> {
        self.heap.first().map(|(k, p)| (k, p))
    }

    /// Insert or re-prioritise `key`.
    pub fn push(&mut self, key: K, priority: P) {
        if let Some(&i) = self.slots.get(&key) {
            let rises = priority > self.heap[i].1;
            self.heap[i].1 = priority;
            if rises {
                self.sift_up(i);
            } else {
                self.sift_down(i);
            }
            return;
        }
        self.heap.push((key.clone(), priority));
        let i = self.heap.len() - 1;
        self.slots.insert(key, i);
        self.sift_up(i);
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.heap.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        let i = *self.slots.get(key)?;
        self.remove_at(i).map(|(_, p)| p)
    }

    fn remove_at(&mut self, i: usize) -> Option<(K, P)> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(i, last);
        let (key, priority) = self.heap.pop()?;
        self.slots.remove(&key);
        if i < self.heap.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        Some((key, priority))
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.slots.insert(self.heap[a].0.clone(), a);
        self.slots.insert(self.heap[b].0.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].1 <= self.heap[parent].1 {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut largest = i;
            if left < self.heap.len() && self.heap[left].1 > self.heap[largest].1 {
                largest = left;
            }
            if right < self.heap.len() && self.heap[right].1 > self.heap[largest].1 {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.swap(i, largest);
            i = largest;
        }
    }
}

/// Heap priority: ranking first, then the earlier insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankKey {
    pub ranking: Decimal,
    seq: Reverse<u64>,
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ranking.cmp(&other.ranking).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PnlRankingIndex {
    books: HashMap<(String, PositionSide), IndexedHeap<AccountId, RankKey>>,
    next_seq: u64,
    /// Keys changed since the last commit, resynced from the store on rollback
    touched: BTreeSet<PositionKey>,
}

impl PnlRankingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-file a position after a write. Flat positions drop out.
    pub fn update(&mut self, position: &Position) {
        let key = position.key();
        self.touched.insert(key.clone());
        let Some(side) = position.side() else {
            self.detach(&key);
            return;
        };
        // keep the original tie-break if the position stays on its side
        let kept_seq = self
            .books
            .get(&(key.symbol.clone(), side))
            .and_then(|h| h.priority(&key.account_id))
            .map(|p| p.seq);
        if let Some(heap) = self.books.get_mut(&(key.symbol.clone(), side.opposite())) {
            heap.remove(&key.account_id);
        }
        let seq = kept_seq.unwrap_or_else(|| {
            self.next_seq += 1;
            Reverse(self.next_seq)
        });
        self.books.entry((key.symbol, side)).or_default().push(
            position.account_id,
            RankKey {
                ranking: position.pnl_ranking,
                seq,
            },
        );
    }

    pub fn remove(&mut self, key: &PositionKey) {
        self.touched.insert(key.clone());
        self.detach(key);
    }

    fn detach(&mut self, key: &PositionKey) {
        for side in [PositionSide::Long, PositionSide::Short] {
            if let Some(heap) = self.books.get_mut(&(key.symbol.clone(), side)) {
                heap.remove(&key.account_id);
            }
        }
    }

    /// Remove and return the highest ranked account on one side.
    pub fn poll(&mut self, symbol: &str, side: PositionSide) -> Option<(AccountId, Decimal)> {
        let (account_id, rank) = self.books.get_mut(&(symbol.to_string(), side))?.pop()?;
        self.touched.insert(PositionKey::new(account_id, symbol));
        Some((account_id, rank.ranking))
    }

    pub fn peek(&self, symbol: &str, side: PositionSide) -> Option<(AccountId, Decimal)> {
        self.books
            .get(&(symbol.to_string(), side))
            .and_then(|h| h.peek())
            .map(|(id, rank)| (*id, rank.ranking))
    }

    pub fn contains(&self, key: &PositionKey, side: PositionSide) -> bool {
        self.books
            .get(&(key.symbol.clone(), side))
            .map_or(false, |h| h.contains(&key.account_id))
    }

    pub fn len(&self, symbol: &str, side: PositionSide) -> usize {
        self.books.get(&(symbol.to_string(), side)).map_or(0, |h| h.len())
    }

    /// Keys to resync after a rollback. The set is kept until commit.
    pub fn touched(&self) -> Vec<PositionKey> {
        self.touched.iter().cloned().collect()
    }

    pub fn commit(&mut self) {
        self.touched.clear();
    }
}
