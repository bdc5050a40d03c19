//! Liquidation detection and execution.
//!
//! Every liquidated position is its own atomic unit: it either commits in
//! full or rolls back and shows up in `CommandOutput::failed_liquidations`.
//! A position walks: cancel orders, optional market close, insurance take-over
//! at the bankrupt price, ADL if the insurance fund cannot carry it, finalize.
//!
//! The one exception is a deleverage that runs out of counterparties after
//! some fills: those fills commit, the remainder stays open and is reported.

use super::core::Engine;
use super::results::EngineError;
use crate::events::FailedLiquidation;
use crate::history::{MarginChange, TransactionKind};
use crate::instrument::Instrument;
use crate::liquidation::{cap_fee, clearance_fee, is_liquidable, LiquidationProgress, LiquidationStage};
use crate::margin::is_bounded;
use crate::order::{Order, OrderNote, OrderStatus, TimeInForce};
use crate::position::Position;
use crate::types::{Leverage, MarginMode, PositionKey, Price, Side};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{error, info, warn};

/// How a liquidation unit ended.
enum Outcome {
    /// Flat and finalized, with the cross positions that became liquidable.
    Closed(Vec<PositionKey>),
    /// Deleveraged in part, this much is still open.
    Partial(Decimal),
}

/// Why a liquidation unit was rolled back.
struct Failure {
    stage: LiquidationStage,
    error: EngineError,
}

trait AtStage<T> {
    fn at(self, stage: LiquidationStage) -> Result<T, Failure>;
}

impl<T> AtStage<T> for Result<T, EngineError> {
    fn at(self, stage: LiquidationStage) -> Result<T, Failure> {
        self.map_err(|error| Failure { stage, error })
    }
}

impl Engine {
    /// Mark `symbol` at `mark` and liquidate every position that breached.
    pub(super) fn liquidate(&mut self, symbol: &str, mark: Price) -> Result<(), EngineError> {
        self.instrument(symbol)?;
        self.set_mark_price(symbol, mark);

        // 13.1: reprice the symbol and every cross book that leans on it
        let mut accounts = BTreeSet::new();
        for position in self.ledger.positions_of_symbol(symbol) {
            if !position.is_empty() {
                accounts.insert(position.account_id);
                self.store_position(position);
            }
        }
        for account_id in accounts {
            self.refresh_cross_positions(account_id);
        }
        self.commit();

        // 13.2: position-id order, chained cross positions queue up behind
        let mut worklist: VecDeque<PositionKey> = self.liquidable_positions(symbol).into();
        let mut attempted = HashSet::new();
        while let Some(key) = worklist.pop_front() {
            if !attempted.insert(key.clone()) || !self.check_liquidable(&key) {
                continue;
            }
            match self.liquidate_position(&key) {
                Ok(Outcome::Closed(chained)) => {
                    self.commit();
                    worklist.extend(chained);
                }
                Ok(Outcome::Partial(left)) => {
                    self.commit();
                    warn!(position = %key, %left, "liquidation kept partial deleverage");
                    self.output.failed_liquidations.push(FailedLiquidation {
                        position: key,
                        stage: LiquidationStage::AutoDeleverage,
                        reason: format!("{left} left open after deleveraging"),
                        at: self.now,
                    });
                }
                Err(Failure { stage, error }) => {
                    self.rollback();
                    error!(position = %key, %stage, %error, "liquidation rolled back");
                    self.output.failed_liquidations.push(FailedLiquidation {
                        position: key,
                        stage,
                        reason: error.to_string(),
                        at: self.now,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_liquidable(&self, key: &PositionKey) -> bool {
        let Some(position) = self.ledger.position(key) else {
            return false;
        };
        let Ok(mark) = self.mark_price(&key.symbol) else {
            return false;
        };
        is_liquidable(&position, mark.value(), self.is_exempt_account(key.account_id))
    }

    fn liquidable_positions(&self, symbol: &str) -> Vec<PositionKey> {
        self.ledger
            .positions_of_symbol(symbol)
            .iter()
            .map(Position::key)
            .filter(|key| self.check_liquidable(key))
            .collect()
    }

    fn liquidate_position(&mut self, key: &PositionKey) -> Result<Outcome, Failure> {
        let instrument = self.instrument(&key.symbol).at(LiquidationStage::CancelOrders)?.clone();
        let mut position = self.position_by_key(key).at(LiquidationStage::CancelOrders)?;
        let size = position.current_qty.abs();
        let margin_before = position.position_margin + position.adjust_margin;
        let realized_before = position.realized_pnl;
        let cross = position.margin_mode == MarginMode::Cross;
        position.liquidation_progress = LiquidationProgress::Liquidating;
        let position = self.store_position(position);
        info!(
            position = %key,
            qty = %position.current_qty,
            liquidation = %position.liquidation_price,
            bankrupt = %position.bankrupt_price,
            "liquidation started"
        );

        // 13.3: a cross account loses every open order, isolated keeps them
        if cross {
            for order in self.ledger.open_orders_of_account(key.account_id) {
                self.cancel_open_order(order, None).at(LiquidationStage::CancelOrders)?;
            }
        }
        let price = self.execution_price(key).at(LiquidationStage::CancelOrders)?;

        if self.ctx.market_close_enabled() && self.is_open(key) {
            self.close_in_market(key).at(LiquidationStage::MarketClose)?;
        }

        if self.is_open(key) {
            self.ledger.checkpoint();
            match self.close_with_insurance(key, price, &instrument) {
                Ok(()) => {}
                Err(err) if err.is_insufficient_balance() && self.ctx.adl_enabled() => {
                    self.ledger.rollback_to_checkpoint();
                    warn!(position = %key, error = %err, "insurance fund cannot take the position, deleveraging");
                }
                Err(err) => return Err(Failure {
                    stage: LiquidationStage::Insurance,
                    error: err,
                }),
            }
        }

        if self.is_open(key) && self.ctx.adl_enabled() {
            let before = self.open_qty(key);
            self.auto_deleverage(key, price, &instrument)
                .at(LiquidationStage::AutoDeleverage)?;
            let left = self.open_qty(key);
            if !left.is_zero() && left < before {
                let mut position = self.position_by_key(key).at(LiquidationStage::AutoDeleverage)?;
                position.liquidation_progress = LiquidationProgress::Normal;
                self.store_position(position);
                return Ok(Outcome::Partial(left));
            }
        }
        if self.is_open(key) {
            return Err(Failure {
                stage: LiquidationStage::AutoDeleverage,
                error: EngineError::InvalidPositionState {
                    position: key.clone(),
                    reason: "position still open after deleveraging".to_string(),
                },
            });
        }

        self.finalize_liquidation(key, size, price, margin_before, realized_before, &instrument)
            .at(LiquidationStage::Finalize)?;

        Ok(Outcome::Closed(if cross { self.chained_liquidations(key) } else { Vec::new() }))
    }

    fn is_open(&self, key: &PositionKey) -> bool {
        !self.open_qty(key).is_zero()
    }

    fn open_qty(&self, key: &PositionKey) -> Decimal {
        self.ledger.position(key).map_or(Decimal::ZERO, |p| p.current_qty.abs())
    }

    /// Bankrupt price of the position, or the mark when it has none.
    fn execution_price(&self, key: &PositionKey) -> Result<Price, EngineError> {
        let position = self.position_by_key(key)?;
        match Price::new(position.bankrupt_price).filter(|p| is_bounded(p.value())) {
            Some(price) => Ok(price),
            None => self.mark_price(&key.symbol),
        }
    }

    /// Engine order drawn from the reserved id pool, active and fee-free.
    fn system_order(
        &mut self,
        position: &Position,
        side: Side,
        qty: Decimal,
        price: Price,
        note: OrderNote,
    ) -> Result<Order, EngineError> {
        let mut order = Order::limit(position.account_id, &position.symbol, side, qty, price)
            .with_tif(TimeInForce::IOC)
            .with_note(note);
        order.margin_mode = position.margin_mode;
        order.leverage = position.leverage;
        order.lock_price = Some(price);
        order.status = OrderStatus::Active;
        Ok(self.ledger.insert_reserved_order(order, self.now)?)
    }

    // 13.4: ioc at the liquidation price against the book
    fn close_in_market(&mut self, key: &PositionKey) -> Result<(), EngineError> {
        let position = self.position_by_key(key)?;
        let Some(side) = Side::closing(position.current_qty) else {
            return Ok(());
        };
        let price = match Price::new(position.liquidation_price).filter(|p| is_bounded(p.value())) {
            Some(price) => price,
            None => self.execution_price(key)?,
        };
        let mut order = Order::limit(key.account_id, &key.symbol, side, position.current_qty.abs(), price)
            .with_tif(TimeInForce::IOC)
            .with_note(OrderNote::Liquidation);
        order.reduce_only = true;
        order.margin_mode = position.margin_mode;
        order.leverage = position.leverage;
        let order = self.ledger.insert_reserved_order(order, self.now)?;
        self.activate_order(order.id)
    }

    // 13.5: the insurance account takes the whole position at the bankrupt price
    fn close_with_insurance(&mut self, key: &PositionKey, price: Price, instrument: &Instrument) -> Result<(), EngineError> {
        let position = self.position_by_key(key)?;
        let Some(side) = Side::closing(position.current_qty) else {
            return Ok(());
        };
        let qty = position.current_qty.abs();

        let insurance = self.insurance_account(&position.asset)?;
        let mut insurance_position = self.ensure_position(&insurance, instrument)?;
        if insurance_position.is_empty() {
            insurance_position.leverage = Leverage::one();
            insurance_position = self.store_position(insurance_position);
        }

        let liquidated = self.system_order(&position, side, qty, price, OrderNote::Liquidation)?;
        let taker = self.system_order(
            &insurance_position,
            side.opposite(),
            qty,
            price,
            OrderNote::InsuranceLiquidation,
        )?;
        self.execute_trade(taker, liquidated, price, qty, instrument, false)?;
        self.validate_account(insurance.id)?;
        info!(position = %key, %qty, %price, "insurance fund took over position");
        Ok(())
    }

    // 13.6: close against the best ranked opposite positions
    fn auto_deleverage(&mut self, key: &PositionKey, price: Price, instrument: &Instrument) -> Result<(), EngineError> {
        loop {
            let position = self.position_by_key(key)?;
            let Some(position_side) = position.side() else {
                return Ok(());
            };
            let Some((account_id, ranking)) = self
                .ledger
                .ranking_mut()
                .poll(&key.symbol, position_side.opposite())
            else {
                warn!(position = %key, remaining = %position.current_qty, "no deleverage counterparty left");
                return Ok(());
            };
            let counter_key = PositionKey::new(account_id, key.symbol.clone());
            let counterparty = match self.ledger.position(&counter_key) {
                Some(p) if account_id != key.account_id && p.side() == Some(position_side.opposite()) => p,
                _ => continue,
            };

            for order in self.ledger.open_orders_of_account(account_id) {
                if order.symbol == key.symbol && order.reduce_only {
                    self.cancel_open_order(order, Some(OrderNote::ReduceOnlyCanceled))?;
                }
            }

            let qty = position.current_qty.abs().min(counterparty.current_qty.abs());
            let side = position_side.closing_side();
            let liquidated = self.system_order(&position, side, qty, price, OrderNote::Liquidation)?;
            let taker = self.system_order(&counterparty, side.opposite(), qty, price, OrderNote::AutoDeleverage)?;
            self.execute_trade(taker, liquidated, price, qty, instrument, false)?;
            info!(position = %key, counterparty = %counter_key, %qty, %ranking, "auto-deleveraged");
        }
    }

    // 13.7: back to normal, then the clearance fee and the isolated margin sweep
    fn finalize_liquidation(
        &mut self,
        key: &PositionKey,
        size: Decimal,
        price: Price,
        margin_before: Decimal,
        realized_before: Decimal,
        instrument: &Instrument,
    ) -> Result<(), EngineError> {
        let mut position = self.position_by_key(key)?;
        position.liquidation_progress = LiquidationProgress::Normal;
        if position.is_isolated() {
            position.adjust_margin = Decimal::ZERO;
        }
        let position = self.store_position(position);
        let insurance = self.insurance_account(&position.asset)?;

        let rate = self
            .rules
            .clearance_fee_rate(&key.symbol, self.ctx.default_clearance_fee_rate());
        let calc = self.calculator(instrument, price);
        let fee = clearance_fee(&calc, size, price.value(), rate);
        let (payable, dropped) = cap_fee(fee, self.available_balance(key.account_id)?);
        if dropped > Decimal::ZERO {
            warn!(position = %key, %fee, %dropped, "clearance fee capped at available balance");
        }
        self.transfer(key.account_id, insurance.id, payable, TransactionKind::ClearanceFee)?;

        if position.is_isolated() {
            let leftover = margin_before + (position.realized_pnl - realized_before);
            let (sweep, _) = cap_fee(leftover, self.available_balance(key.account_id)?);
            if sweep > Decimal::ZERO {
                self.transfer(key.account_id, insurance.id, sweep, TransactionKind::InsuranceSweep)?;
                self.record_margin_history(&position, MarginChange::LiquidationSweep, -sweep)?;
            }
        }
        info!(position = %key, clearance_fee = %payable, "liquidation finished");
        Ok(())
    }

    fn chained_liquidations(&self, key: &PositionKey) -> Vec<PositionKey> {
        self.ledger
            .positions_of_account(key.account_id)
            .iter()
            .filter(|p| p.margin_mode == MarginMode::Cross && p.symbol != key.symbol)
            .map(Position::key)
            .filter(|k| self.check_liquidable(k))
            .collect()
    }
}
