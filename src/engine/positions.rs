//! Position management: liquidation data, leverage and isolated margin.

use super::commands::{LeverageRequest, MarginRequest};
use super::core::Engine;
use super::results::EngineError;
use crate::account::Account;
use crate::history::{MarginChange, MarginHistory, PositionHistory};
use crate::instrument::Instrument;
use crate::margin::{MaintenanceTier, MarginCalculator};
use crate::position::Position;
use crate::types::{AccountId, ContractType, HistoryId, Leverage, MarginMode, PositionKey, Price};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info};

/// Leverage of a freshly created position, capped by the symbol's tiers.
const DEFAULT_LEVERAGE: Decimal = dec!(10);

impl Engine {
    /// Load the position of `account` on the instrument, creating it flat on first use.
    pub(super) fn ensure_position(&mut self, account: &Account, instrument: &Instrument) -> Result<Position, EngineError> {
        let key = PositionKey::new(account.id, instrument.symbol.clone());
        if let Some(position) = self.ledger.position(&key) {
            return Ok(position);
        }
        let leverage = self
            .rules
            .max_leverage(&instrument.symbol)
            .map_or(DEFAULT_LEVERAGE, |max| max.min(DEFAULT_LEVERAGE));
        let position = Position::new(
            account.id,
            instrument.symbol.clone(),
            instrument.settle_asset.clone(),
            MarginMode::Cross,
            Leverage::new(leverage).unwrap_or_else(Leverage::one),
        );
        Ok(self.ledger.insert_position(position, self.now)?)
    }

    pub(super) fn position_by_key(&self, key: &PositionKey) -> Result<Position, EngineError> {
        self.ledger.position(key).ok_or_else(|| EngineError::InvalidPositionState {
            position: key.clone(),
            reason: "no position".to_string(),
        })
    }

    /// Refresh liquidation data and stage the position.
    pub(super) fn store_position(&mut self, mut position: Position) -> Position {
        self.refresh_liquidation_data(&mut position);
        self.ledger.save_position(position, self.now)
    }

    /// Re-stage every open cross position of the account. Called after any
    /// wallet change since cross prices depend on the balance.
    pub(super) fn refresh_cross_positions(&mut self, account_id: AccountId) {
        for position in self.ledger.positions_of_account(account_id) {
            if position.margin_mode == MarginMode::Cross && !position.is_empty() {
                self.store_position(position);
            }
        }
    }

    // 10.1: recompute derived risk fields. a failure leaves the old values in
    // place and must never fail the command that wrote the position.
    pub(super) fn refresh_liquidation_data(&self, position: &mut Position) {
        if position.is_empty() {
            position.maintenance_margin = Decimal::ZERO;
            position.liquidation_price = Decimal::ZERO;
            position.bankrupt_price = Decimal::ZERO;
            position.tmp_total_fee = Decimal::ZERO;
            position.pnl_ranking = Decimal::ZERO;
            if position.margin_mode == MarginMode::Cross {
                position.position_margin = Decimal::ZERO;
            }
            return;
        }
        if let Err(err) = self.compute_liquidation_data(position) {
            error!(position = %position.key(), error = %err, "liquidation data not refreshed");
        }
    }

    fn compute_liquidation_data(&self, position: &mut Position) -> Result<(), EngineError> {
        let instrument = self.instrument(&position.symbol)?;
        let mark = self.mark_price(&position.symbol)?;
        let calc = MarginCalculator::new(instrument, mark);
        let qty = position.current_qty;
        let tier = self.maintenance_tier(instrument, qty, mark);

        let maintenance = calc.maintenance_margin(qty, tier);
        let (margin, bankrupt_margin) = match position.margin_mode {
            MarginMode::Isolated => {
                let allocated = calc.allocated_margin(position);
                (allocated, allocated)
            }
            MarginMode::Cross => {
                position.position_margin = calc.cross_margin(qty, position.leverage.value());
                let others = self.cross_context(position)?;
                (
                    others.wallet - others.isolated_allocated - others.cross_maintenance + others.cross_upnl,
                    others.wallet - others.isolated_allocated + others.cross_upnl,
                )
            }
        };

        position.maintenance_margin = maintenance;
        position.liquidation_price = calc.liquidation_price(qty, position.entry_value, margin, tier);
        position.bankrupt_price = calc.bankrupt_price(qty, position.entry_value, bankrupt_margin);
        position.tmp_total_fee = if position.is_isolated() {
            let rate = self
                .rules
                .clearance_fee_rate(&position.symbol, self.ctx.default_clearance_fee_rate());
            calc.tmp_total_fee(qty, position.liquidation_price, rate)
        } else {
            Decimal::ZERO
        };
        position.pnl_ranking = calc.pnl_ranking(qty, position.entry_price, position.bankrupt_price);
        Ok(())
    }

    /// Tier by notional in the quote currency. Inverse maintenance amounts are
    /// converted into the settle asset at the mark.
    pub(super) fn maintenance_tier(&self, instrument: &Instrument, qty: Decimal, mark: Price) -> MaintenanceTier {
        let notional = match instrument.contract_type {
            ContractType::Linear => qty.abs() * mark.value(),
            ContractType::Inverse => qty.abs() * instrument.multiplier,
        };
        let Some(rule) = self.rules.tier_for(&instrument.symbol, notional) else {
            return MaintenanceTier::default();
        };
        let amount = match instrument.contract_type {
            ContractType::Linear => rule.maintenance_amount,
            ContractType::Inverse => rule.maintenance_amount / mark.value(),
        };
        MaintenanceTier::new(rule.maintenance_margin_rate, amount)
    }

    // the rest of the account as seen from one cross position
    fn cross_context(&self, position: &Position) -> Result<CrossContext, EngineError> {
        let account = self
            .ledger
            .account(position.account_id)
            .ok_or(EngineError::AccountNotFound(position.account_id))?;
        let mut ctx = CrossContext {
            wallet: account.balance,
            ..CrossContext::default()
        };
        for other in self.ledger.positions_of_account(position.account_id) {
            if other.symbol == position.symbol || other.is_empty() {
                continue;
            }
            match other.margin_mode {
                MarginMode::Isolated => ctx.isolated_allocated += other.position_margin + other.adjust_margin,
                MarginMode::Cross => {
                    let live = self
                        .instruments
                        .get(&other.symbol)
                        .zip(self.mark_price(&other.symbol).ok());
                    match live {
                        Some((instrument, mark)) => {
                            let calc = MarginCalculator::new(instrument, mark);
                            let tier = self.maintenance_tier(instrument, other.current_qty, mark);
                            ctx.cross_maintenance += calc.maintenance_margin(other.current_qty, tier);
                            ctx.cross_upnl += calc.unrealized_pnl(other.current_qty, other.entry_value);
                        }
                        None => ctx.cross_maintenance += other.maintenance_margin,
                    }
                }
            }
        }
        Ok(ctx)
    }

    pub(super) fn record_position_history(&mut self, position: &Position) -> Result<(), EngineError> {
        let row = PositionHistory {
            id: HistoryId(0),
            position_id: position.id,
            qty: position.current_qty,
            entry_price: position.entry_price,
            created_at: self.now,
        };
        self.ledger.insert_position_history(row, self.now)?;
        Ok(())
    }

    pub(super) fn record_margin_history(
        &mut self,
        position: &Position,
        kind: MarginChange,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        let row = MarginHistory {
            id: HistoryId(0),
            position_id: position.id,
            account_id: position.account_id,
            symbol: position.symbol.clone(),
            kind,
            amount,
            margin_after: position.position_margin + position.adjust_margin,
            leverage: position.leverage,
            created_at: self.now,
        };
        self.ledger.insert_margin_history(row, self.now)?;
        Ok(())
    }

    // 10.2: leverage and margin mode only change while flat
    pub(super) fn adjust_leverage(&mut self, request: LeverageRequest) -> Result<(), EngineError> {
        let instrument = self.instrument(&request.symbol)?.clone();
        let account = self.account_for_user(request.user_id, &instrument.settle_asset)?;
        let mut position = self.ensure_position(&account, &instrument)?;
        self.apply_leverage(&mut position, request.leverage, request.margin_mode)?;

        let position = self.store_position(position);
        self.record_margin_history(&position, MarginChange::AdjustLeverage, Decimal::ZERO)?;
        info!(position = %position.key(), leverage = %position.leverage, mode = ?position.margin_mode, "leverage adjusted");
        Ok(())
    }

    /// Validate and set leverage (and optionally mode) on a flat position.
    pub(super) fn apply_leverage(
        &self,
        position: &mut Position,
        leverage: Decimal,
        margin_mode: Option<MarginMode>,
    ) -> Result<(), EngineError> {
        if !position.is_empty() {
            return Err(EngineError::InvalidPositionState {
                position: position.key(),
                reason: "leverage and margin mode only change while flat".to_string(),
            });
        }
        let symbol = position.symbol.clone();
        let max = self.rules.max_leverage(&symbol).unwrap_or(Decimal::MAX);
        let invalid = || EngineError::InvalidLeverage {
            symbol: symbol.clone(),
            leverage,
            max,
        };
        if leverage > max {
            return Err(invalid());
        }
        position.leverage = Leverage::new(leverage).ok_or_else(invalid)?;
        if let Some(mode) = margin_mode {
            position.margin_mode = mode;
        }
        Ok(())
    }

    // 10.3: move margin in or out of an isolated position
    pub(super) fn adjust_margin_position(&mut self, request: MarginRequest) -> Result<(), EngineError> {
        let instrument = self.instrument(&request.symbol)?.clone();
        let account = self.account_for_user(request.user_id, &instrument.settle_asset)?;
        let key = PositionKey::new(account.id, request.symbol.clone());
        let mut position = self.position_by_key(&key)?;
        if !position.is_isolated() || position.is_empty() {
            return Err(EngineError::InvalidPositionState {
                position: key,
                reason: "margin can only be adjusted on an open isolated position".to_string(),
            });
        }
        if request.amount.is_zero() {
            return Err(EngineError::InvalidAmount(request.amount));
        }

        position.adjust_margin += request.amount;
        self.refresh_liquidation_data(&mut position);
        let allocated = position.position_margin + position.adjust_margin;
        if request.amount < Decimal::ZERO && allocated <= position.maintenance_margin {
            return Err(EngineError::InvalidPositionState {
                position: key,
                reason: format!("allocated margin {allocated} would not cover maintenance"),
            });
        }
        let position = self.ledger.save_position(position, self.now);
        self.validate_account(account.id)?;
        self.record_margin_history(&position, MarginChange::AdjustMargin, request.amount)?;
        info!(position = %key, amount = %request.amount, "isolated margin adjusted");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CrossContext {
    wallet: Decimal,
    isolated_allocated: Decimal,
    cross_maintenance: Decimal,
    cross_upnl: Decimal,
}
