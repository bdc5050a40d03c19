//! Wallet accounts.
//!
//! One account per (user, asset). Margin is never moved out of the wallet;
//! positions and resting orders only reserve part of it, which is why the
//! available balance is computed from the positions (see `engine/accounts.rs`).

use crate::store::Entity;
use crate::types::{AccountId, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub asset: String,
    pub balance: Decimal,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Account {
    pub fn new(user_id: UserId, asset: impl Into<String>) -> Self {
        Self {
            id: AccountId(0),
            user_id,
            asset: asset.into(),
            balance: Decimal::ZERO,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
    }

    /// Apply a signed change and clamp at zero. Returns the shortfall that
    /// could not be covered.
    pub fn apply_clamped(&mut self, amount: Decimal) -> Decimal {
        let next = self.balance + amount;
        if next < Decimal::ZERO {
            self.balance = Decimal::ZERO;
            -next
        } else {
            self.balance = next;
            Decimal::ZERO
        }
    }
}

impl Entity for Account {
    type Key = AccountId;

    fn key(&self) -> AccountId {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = AccountId(id);
    }

    fn stamp(&mut self, now: Timestamp, created: bool) {
        if created {
            self.created_at = now;
        }
        self.updated_at = now;
    }
}
