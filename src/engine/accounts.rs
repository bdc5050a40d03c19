//! Wallet operations and balance checks.

use super::commands::WalletRequest;
use super::core::Engine;
use super::results::EngineError;
use crate::account::Account;
use crate::history::{Transaction, TransactionKind};
use crate::margin::MarginCalculator;
use crate::types::{AccountId, MarginMode, UserId};
use rust_decimal::Decimal;
use tracing::{info, warn};

impl Engine {
    pub(super) fn deposit(&mut self, request: WalletRequest) -> Result<(), EngineError> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(request.amount));
        }
        self.check_hash(request.hash.as_deref())?;

        let mut account = match self.ledger.account_for(request.user_id, &request.asset) {
            Some(account) => account,
            None => self
                .ledger
                .insert_account(Account::new(request.user_id, request.asset.clone()), self.now)?,
        };
        account.credit(request.amount);
        let account = self.ledger.save_account(account, self.now);

        let tx = Transaction::new(account.id, &request.asset, request.amount, TransactionKind::Deposit)
            .with_hash(request.hash);
        self.ledger.insert_transaction(tx, self.now)?;
        self.refresh_cross_positions(account.id);

        info!(user = request.user_id.0, asset = %request.asset, amount = %request.amount, "deposit");
        Ok(())
    }

    pub(super) fn withdraw(&mut self, request: WalletRequest) -> Result<(), EngineError> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(request.amount));
        }
        self.check_hash(request.hash.as_deref())?;

        let mut account = self.account_for_user(request.user_id, &request.asset)?;
        account.credit(-request.amount);
        let account = self.ledger.save_account(account, self.now);

        let tx = Transaction::new(account.id, &request.asset, -request.amount, TransactionKind::Withdraw)
            .with_hash(request.hash);
        self.ledger.insert_transaction(tx, self.now)?;
        self.refresh_cross_positions(account.id);
        self.validate_account(account.id)?;

        info!(user = request.user_id.0, asset = %request.asset, amount = %request.amount, "withdraw");
        Ok(())
    }

    fn check_hash(&self, hash: Option<&str>) -> Result<(), EngineError> {
        match hash {
            Some(hash) if self.ledger.is_duplicate_hash(hash) => Err(EngineError::DuplicateTransaction(hash.to_string())),
            _ => Ok(()),
        }
    }

    pub(super) fn account_for_user(&self, user_id: UserId, asset: &str) -> Result<Account, EngineError> {
        self.ledger
            .account_for(user_id, asset)
            .ok_or_else(|| EngineError::UserAccountNotFound {
                user_id,
                asset: asset.to_string(),
            })
    }

    /// Insurance fund account for `asset`, opened on first use.
    pub(super) fn insurance_account(&mut self, asset: &str) -> Result<Account, EngineError> {
        let user_id = self
            .ctx
            .insurance_user(asset)
            .ok_or_else(|| EngineError::InsuranceAccountMissing(asset.to_string()))?;
        match self.ledger.account_for(user_id, asset) {
            Some(account) => Ok(account),
            None => Ok(self.ledger.insert_account(Account::new(user_id, asset), self.now)?),
        }
    }

    pub(super) fn is_exempt_account(&self, account_id: AccountId) -> bool {
        self.ledger
            .account(account_id)
            .map_or(false, |a| self.ctx.is_exempt(a.user_id))
    }

    // 9.1: wallet balance minus everything positions and resting orders hold,
    // plus unrealized pnl of cross positions.
    pub fn available_balance(&self, account_id: AccountId) -> Result<Decimal, EngineError> {
        let account = self
            .ledger
            .account(account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let mut available = account.balance;

        for position in self.ledger.positions_of_account(account_id) {
            available -= position.order_cost;
            if position.is_empty() {
                continue;
            }
            match position.margin_mode {
                MarginMode::Isolated => {
                    available -= position.position_margin + position.adjust_margin + position.tmp_total_fee;
                }
                MarginMode::Cross => {
                    let live = self
                        .instruments
                        .get(&position.symbol)
                        .zip(self.mark_price(&position.symbol).ok());
                    match live {
                        Some((instrument, mark)) => {
                            let calc = MarginCalculator::new(instrument, mark);
                            available -= calc.cross_margin(position.current_qty, position.leverage.value());
                            available += calc.unrealized_pnl(position.current_qty, position.entry_value);
                        }
                        None => available -= position.position_margin,
                    }
                }
            }
        }
        Ok(available)
    }

    /// Fails when either the raw or the available balance is negative.
    pub(super) fn validate_account(&self, account_id: AccountId) -> Result<(), EngineError> {
        let account = self
            .ledger
            .account(account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let available = self.available_balance(account_id)?;
        if account.balance < Decimal::ZERO || available < Decimal::ZERO {
            return Err(EngineError::InsufficientBalance { account_id, available });
        }
        Ok(())
    }

    // 9.2: apply a signed wallet change. a loss larger than the balance
    // leaves the account at zero and the insurance fund covers the rest.
    pub(super) fn apply_balance_change(&mut self, account_id: AccountId, amount: Decimal) -> Result<Decimal, EngineError> {
        let mut account = self
            .ledger
            .account(account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let shortfall = account.apply_clamped(amount);
        let account = self.ledger.save_account(account, self.now);

        if shortfall > Decimal::ZERO {
            warn!(account = account_id.0, asset = %account.asset, %shortfall, "balance clamped at zero");
            self.cover_shortfall(&account, shortfall)?;
        }
        self.refresh_cross_positions(account_id);
        Ok(shortfall)
    }

    fn cover_shortfall(&mut self, account: &Account, shortfall: Decimal) -> Result<(), EngineError> {
        let mut insurance = match self.insurance_account(&account.asset) {
            Ok(insurance) if insurance.id != account.id => insurance,
            Ok(_) => {
                warn!(asset = %account.asset, %shortfall, "insurance fund itself ran dry");
                return Ok(());
            }
            Err(err) => {
                warn!(asset = %account.asset, %shortfall, error = %err, "shortfall left uncovered");
                return Ok(());
            }
        };
        let uncovered = insurance.apply_clamped(-shortfall);
        if uncovered > Decimal::ZERO {
            warn!(asset = %account.asset, %uncovered, "insurance fund could not cover shortfall");
        }
        let insurance = self.ledger.save_account(insurance, self.now);

        let asset = account.asset.as_str();
        self.ledger.insert_transaction(
            Transaction::new(account.id, asset, shortfall, TransactionKind::ShortfallCover),
            self.now,
        )?;
        self.ledger.insert_transaction(
            Transaction::new(insurance.id, asset, -shortfall, TransactionKind::ShortfallCover),
            self.now,
        )?;
        Ok(())
    }

    /// Move `amount` between two accounts as a debit/credit pair.
    pub(super) fn transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        kind: TransactionKind,
    ) -> Result<(), EngineError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        let asset = self
            .ledger
            .account(from)
            .ok_or(EngineError::AccountNotFound(from))?
            .asset;
        self.apply_balance_change(from, -amount)?;
        self.apply_balance_change(to, amount)?;
        self.ledger
            .insert_transaction(Transaction::new(from, &asset, -amount, kind), self.now)?;
        self.ledger
            .insert_transaction(Transaction::new(to, &asset, amount, kind), self.now)?;
        Ok(())
    }
}
