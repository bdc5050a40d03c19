//! Staged entity store.
//!
//! Every aggregate (accounts, positions, orders, trades, history rows) lives in
//! one `EntityStore`. Writes land in a staged layer and only become durable on
//! `commit`. A checkpoint layer sits between staged and committed so a risky
//! sub-step can be undone without losing the earlier writes of the command.
//!
//! Reads resolve staged → checkpoint → committed and hand back owned copies, so
//! a caller can never mutate stored state except through `update`.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;

/// An aggregate that can be kept in an [`EntityStore`].
pub trait Entity: Clone {
    type Key: Clone + Ord + Debug;

    fn key(&self) -> Self::Key;

    /// Called once on insert with the sequence (or reserved) id.
    fn assign_id(&mut self, id: u64);

    /// Stamp creation/update times. `created` is true on insert.
    fn stamp(&mut self, now: Timestamp, created: bool);

    /// When a committed copy of this entity may be evicted, if ever.
    fn expires_at(&self, _ttl_ms: Option<i64>) -> Option<Timestamp> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Id sequence for {0} store was never initialized")]
    SequenceUninitialized(&'static str),

    #[error("Reserved id pool is exhausted")]
    ReservedIdsExhausted,

    #[error("Duplicate key {key} in {store} store")]
    DuplicateKey { store: &'static str, key: String },
}

#[derive(Debug, Clone)]
pub struct EntityStore<E: Entity> {
    name: &'static str,
    committed: BTreeMap<E::Key, E>,
    checkpoint: BTreeMap<E::Key, E>,
    staged: BTreeMap<E::Key, E>,
    sequence: Option<u64>,
    ttl_ms: Option<i64>,
    expiry_queue: VecDeque<(Timestamp, E::Key)>,
}

impl<E: Entity> EntityStore<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            committed: BTreeMap::new(),
            checkpoint: BTreeMap::new(),
            staged: BTreeMap::new(),
            sequence: None,
            ttl_ms: None,
            expiry_queue: VecDeque::new(),
        }
    }

    pub fn with_ttl(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Seed the sequence with the last id handed out by a previous run.
    pub fn initialize(&mut self, last_id: u64) {
        self.sequence = Some(last_id);
    }

    pub fn is_initialized(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.sequence
    }

    fn next_id(&mut self) -> Result<u64, StoreError> {
        let seq = self
            .sequence
            .as_mut()
            .ok_or(StoreError::SequenceUninitialized(self.name))?;
        *seq += 1;
        Ok(*seq)
    }

    /// Insert a new entity under the next sequence id.
    pub fn insert(&mut self, entity: E, now: Timestamp) -> Result<E, StoreError> {
        let id = self.next_id()?;
        self.insert_with_id(entity, id, now)
    }

    /// Insert a new entity under an id drawn elsewhere (reserved pool).
    pub fn insert_with_id(&mut self, mut entity: E, id: u64, now: Timestamp) -> Result<E, StoreError> {
        entity.assign_id(id);
        entity.stamp(now, true);
        let key = entity.key();
        if self.contains(&key) {
            return Err(StoreError::DuplicateKey {
                store: self.name,
                key: format!("{key:?}"),
            });
        }
        self.staged.insert(key, entity.clone());
        Ok(entity)
    }

    /// Re-stage an entity. Returns the stamped copy that was stored.
    pub fn update(&mut self, mut entity: E, now: Timestamp) -> E {
        entity.stamp(now, false);
        self.staged.insert(entity.key(), entity.clone());
        entity
    }

    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.peek(key).cloned()
    }

    /// Borrowing read for hot paths that never hand the entity out.
    pub fn peek(&self, key: &E::Key) -> Option<&E> {
        self.staged
            .get(key)
            .or_else(|| self.checkpoint.get(key))
            .or_else(|| self.committed.get(key))
    }

    pub fn contains(&self, key: &E::Key) -> bool {
        self.peek(key).is_some()
    }

    /// Read the last committed value, ignoring anything staged.
    pub fn get_committed(&self, key: &E::Key) -> Option<E> {
        self.committed.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<E::Key> {
        let mut keys: BTreeSet<E::Key> = self.committed.keys().cloned().collect();
        keys.extend(self.checkpoint.keys().cloned());
        keys.extend(self.staged.keys().cloned());
        keys.into_iter().collect()
    }

    pub fn values(&self) -> Vec<E> {
        self.keys().iter().filter_map(|k| self.get(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.checkpoint.is_empty() && self.staged.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.staged.is_empty() || !self.checkpoint.is_empty()
    }

    /// Keys written since the last commit.
    pub fn pending_keys(&self) -> Vec<E::Key> {
        let mut keys: BTreeSet<E::Key> = self.checkpoint.keys().cloned().collect();
        keys.extend(self.staged.keys().cloned());
        keys.into_iter().collect()
    }

    /// Freeze the staged writes into the checkpoint layer.
    pub fn checkpoint(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        self.checkpoint.extend(staged);
    }

    /// Drop everything staged since the last checkpoint.
    pub fn rollback_to_checkpoint(&mut self) {
        self.staged.clear();
    }

    /// Drop every uncommitted write.
    pub fn rollback(&mut self) {
        self.staged.clear();
        self.checkpoint.clear();
    }

    /// Merge checkpoint and staged into committed. Returns the committed keys.
    pub fn commit(&mut self) -> Vec<E::Key> {
        if !self.has_pending() {
            return Vec::new();
        }
        let checkpoint = std::mem::take(&mut self.checkpoint);
        let staged = std::mem::take(&mut self.staged);
        let mut keys = BTreeSet::new();

        for (key, entity) in checkpoint.into_iter().chain(staged) {
            self.committed.insert(key.clone(), entity);
            keys.insert(key);
        }
        for key in &keys {
            if let Some(deadline) = self.committed.get(key).and_then(|e| e.expires_at(self.ttl_ms)) {
                self.expiry_queue.push_back((deadline, key.clone()));
            }
        }
        keys.into_iter().collect()
    }

    /// Evict committed entities whose expiry passed. Entities with pending
    /// writes are left alone. Returns the evicted keys.
    pub fn reap(&mut self, now: Timestamp) -> Vec<E::Key> {
        let mut evicted = Vec::new();
        let mut deferred = Vec::new();
        // deadlines are pushed in commit order, so the due entries sit at the front
        while let Some((deadline, _)) = self.expiry_queue.front() {
            if *deadline > now {
                break;
            }
            let Some((deadline, key)) = self.expiry_queue.pop_front() else {
                break;
            };
            if self.staged.contains_key(&key) || self.checkpoint.contains_key(&key) {
                deferred.push((deadline, key));
                continue;
            }
            let still_due = self
                .committed
                .get(&key)
                .and_then(|e| e.expires_at(self.ttl_ms))
                .map_or(false, |t| t <= now);
            if still_due {
                self.committed.remove(&key);
                evicted.push(key);
            }
        }
        self.expiry_queue.extend(deferred);
        evicted
    }
}

/// Bounded pool of pre-allocated ids for liquidation, insurance and ADL orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdPool {
    ids: VecDeque<u64>,
    capacity: usize,
    low_watermark: usize,
}

impl IdPool {
    pub fn new(capacity: usize, low_watermark: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
            low_watermark,
        }
    }

    /// Top the pool up. Ids beyond capacity are dropped. Returns how many were taken.
    pub fn refill(&mut self, ids: impl IntoIterator<Item = u64>) -> usize {
        let mut taken = 0;
        for id in ids {
            if self.ids.len() >= self.capacity {
                break;
            }
            if !self.ids.contains(&id) {
                self.ids.push_back(id);
                taken += 1;
            }
        }
        taken
    }

    pub fn draw(&mut self) -> Result<u64, StoreError> {
        self.ids.pop_front().ok_or(StoreError::ReservedIdsExhausted)
    }

    pub fn remaining(&self) -> usize {
        self.ids.len()
    }

    pub fn needs_refill(&self) -> bool {
        self.ids.len() <= self.low_watermark
    }
}
