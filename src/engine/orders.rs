//! Order management: placement, activation, cancellation and triggers.

use super::commands::OrderRequest;
use super::core::Engine;
use super::results::EngineError;
use crate::conditional::{is_triggered, reduce_only_conflicts, reducible_quantity};
use crate::margin::charged_cost;
use crate::order::{Order, OrderNote, OrderStatus, OrderType, TimeInForce, TpSl};
use crate::types::{OrderId, PositionKey, Side};
use rust_decimal::Decimal;
use tracing::{debug, info};

impl Engine {
    /// Place a new order. Conditional orders are stored untriggered, all
    /// others are activated and matched straight away.
    pub(super) fn place_order(&mut self, request: OrderRequest) -> Result<OrderId, EngineError> {
        let instrument = self.instrument(&request.symbol)?.clone();
        instrument.validate_size(request.quantity)?;

        let price = match request.order_type {
            OrderType::Limit => {
                let raw = request
                    .price
                    .ok_or_else(|| EngineError::InvalidOrder("limit order without a price".to_string()))?;
                Some(instrument.validate_price(raw)?)
            }
            OrderType::Market => None,
        };
        let trigger = request
            .trigger_price
            .map(|p| instrument.validate_price(p))
            .transpose()?;
        if request.tp_sl.is_some() && trigger.is_none() {
            return Err(EngineError::InvalidOrder("take-profit/stop-loss without a trigger price".to_string()));
        }
        if request.post_only && request.order_type == OrderType::Market {
            return Err(EngineError::InvalidOrder("post-only market order".to_string()));
        }

        let account = self.account_for_user(request.user_id, &instrument.settle_asset)?;
        if let Some(rule) = self.rules.trading_rule(&request.symbol).filter(|r| r.max_open_orders > 0) {
            let open = self
                .ledger
                .open_orders_of_account(account.id)
                .iter()
                .filter(|o| o.symbol == request.symbol)
                .count();
            if open >= rule.max_open_orders {
                return Err(EngineError::InvalidOrder(format!(
                    "{open} open orders on {}, limit is {}",
                    request.symbol, rule.max_open_orders
                )));
            }
        }
        let mut position = self.ensure_position(&account, &instrument)?;
        let wants_change = request.margin_mode.map_or(false, |m| m != position.margin_mode)
            || request.leverage.map_or(false, |l| l != position.leverage.value());
        if wants_change {
            let leverage = request.leverage.unwrap_or(position.leverage.value());
            self.apply_leverage(&mut position, leverage, request.margin_mode)?;
            position = self.store_position(position);
        }

        let mut order = match price {
            Some(price) => Order::limit(account.id, &request.symbol, request.side, request.quantity, price),
            None => Order::market(account.id, &request.symbol, request.side, request.quantity),
        };
        order.time_in_force = match (request.order_type, request.time_in_force) {
            (OrderType::Market, TimeInForce::GTC) => TimeInForce::IOC,
            (_, tif) => tif,
        };
        order.margin_mode = position.margin_mode;
        order.leverage = position.leverage;
        order.reduce_only = request.reduce_only || request.tp_sl.is_some();
        order.post_only = request.post_only;
        order.trigger_price = trigger;
        order.tp_sl = request.tp_sl;

        if trigger.is_none() {
            let order = self.ledger.insert_order(order, self.now)?;
            self.activate_order(order.id)?;
            return Ok(order.id);
        }

        // 11.1: conditional orders hold no margin until triggered
        order.status = OrderStatus::Untriggered;
        if order.tp_sl.is_some() {
            if Side::closing(position.current_qty) != Some(order.side) {
                return Err(EngineError::InvalidPositionState {
                    position: position.key(),
                    reason: "take-profit/stop-loss must close the position".to_string(),
                });
            }
            order.quantity = position.current_qty.abs();
            order.remaining = order.quantity;
        }
        let order = self.ledger.insert_order(order, self.now)?;
        if let Some(kind) = order.tp_sl {
            self.link_tp_sl(&position.key(), order.id, kind)?;
        }
        info!(order = order.id.0, symbol = %order.symbol, trigger = ?order.trigger_price, "conditional order stored");
        Ok(order.id)
    }

    /// Attach a TP/SL order to its position, canceling the one it replaces.
    fn link_tp_sl(&mut self, key: &PositionKey, order_id: OrderId, kind: TpSl) -> Result<(), EngineError> {
        let mut position = self.position_by_key(key)?;
        let slot = match kind {
            TpSl::TakeProfit => &mut position.take_profit_order_id,
            TpSl::StopLoss => &mut position.stop_loss_order_id,
        };
        let replaced = slot.replace(order_id);
        self.ledger.save_position(position, self.now);
        if let Some(old) = replaced.and_then(|id| self.ledger.order(id)).filter(|o| o.is_open()) {
            self.cancel_open_order(old, None)?;
        }
        Ok(())
    }

    // 11.2: activation. lock price, reduce-only trim, post-only and fok
    // checks, margin reservation, then matching.
    pub(super) fn activate_order(&mut self, order_id: OrderId) -> Result<(), EngineError> {
        let mut order = self.ledger.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Pending {
            return Err(EngineError::InvalidOrderStatus {
                order_id,
                status: order.status,
            });
        }
        let instrument = self.instrument(&order.symbol)?.clone();
        let key = PositionKey::new(order.account_id, order.symbol.clone());
        let mut position = self.position_by_key(&key)?;

        let lock = match order.order_type {
            OrderType::Limit => order
                .price
                .ok_or_else(|| EngineError::InvalidOrder("limit order without a price".to_string()))?,
            OrderType::Market => self
                .ledger
                .book(&order.symbol)
                .and_then(|b| b.lock_price(order.side, order.remaining))
                .ok_or_else(|| EngineError::LockPriceUnavailable(order.symbol.clone()))?,
        };
        order.lock_price = Some(lock);

        if order.reduce_only {
            let reducible = reducible_quantity(&order, position.current_qty);
            if reducible.is_zero() {
                self.cancel_open_order(order, Some(OrderNote::ReduceOnlyCanceled))?;
                return Ok(());
            }
            if reducible < order.remaining {
                order.remaining = reducible;
                order.note = order.note.or(Some(OrderNote::ReduceOnlyCanceled));
            }
        }

        let book = self.ledger.book(&order.symbol);
        let crosses = book
            .and_then(|b| b.best(order.side.opposite()))
            .map_or(false, |best| order.crosses(best));
        let matchable = book.map_or(Decimal::ZERO, |b| b.matchable(order.side, order.limit_price()));
        if order.post_only && crosses {
            debug!(order = order_id.0, "post-only order would cross, canceled");
            self.cancel_open_order(order, None)?;
            return Ok(());
        }
        if order.time_in_force == TimeInForce::FOK && matchable < order.remaining {
            debug!(order = order_id.0, %matchable, "fok order cannot fill, canceled");
            order.remaining = order.quantity;
            self.cancel_open_order(order, None)?;
            return Ok(());
        }

        let checked = !order.is_system() && !order.reduce_only;
        if checked {
            let calc = self.calculator(&instrument, lock);
            let open = calc.open_size(order.side, order.remaining, position.current_qty);
            let raw = calc.order_reservation(order.side, open, lock.value(), order.leverage.value());
            order.order_cost = charged_cost(order.side, raw, position.mar_buy, position.mar_sel);
            order.reserved = raw;
            position.reserve(order.side, raw);
            self.store_position(position);
        }
        order.status = OrderStatus::Active;
        let order = self.ledger.save_order(order, self.now);
        if checked {
            self.validate_account(order.account_id)?;
        }

        let fok = order.time_in_force == TimeInForce::FOK;
        if fok {
            self.ledger.checkpoint();
        }
        self.match_order(order_id, &instrument)?;

        let mut order = self.ledger.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if fok && order.is_open() && order.remaining > Decimal::ZERO {
            // a reduce-only maker dropped out mid-walk: undo the partial fill
            self.ledger.rollback_to_checkpoint();
            order = self.ledger.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
            order.remaining = order.quantity;
        }
        self.finish_taker(order)
    }

    /// Rest what is left of a GTC limit order, cancel the rest of anything else.
    fn finish_taker(&mut self, order: Order) -> Result<(), EngineError> {
        if order.is_closed() {
            return Ok(());
        }
        let rests = order.order_type == OrderType::Limit && order.time_in_force == TimeInForce::GTC;
        match (rests, order.price) {
            (true, Some(price)) => {
                self.ledger
                    .book_mut(&order.symbol)
                    .insert(order.side, price, order.id, order.remaining);
                debug!(order = order.id.0, %price, remaining = %order.remaining, "order resting");
                self.ledger.save_order(order, self.now);
                Ok(())
            }
            _ => self.cancel_open_order(order, None).map(|_| ()),
        }
    }

    pub(super) fn cancel_order(&mut self, order_id: OrderId) -> Result<(), EngineError> {
        let order = self.ledger.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if order.is_closed() {
            return Err(EngineError::InvalidOrderStatus {
                order_id,
                status: order.status,
            });
        }
        let order = self.cancel_open_order(order, None)?;
        info!(order = order_id.0, symbol = %order.symbol, "order canceled");
        Ok(())
    }

    /// Take an open order off the book, release its reservation and unlink it.
    pub(super) fn cancel_open_order(&mut self, mut order: Order, note: Option<OrderNote>) -> Result<Order, EngineError> {
        if order.status == OrderStatus::Active {
            if let Some(price) = order.price {
                self.ledger.book_mut(&order.symbol).remove(order.side, price, order.id);
            }
        }
        let released = std::mem::take(&mut order.reserved);
        order.status = OrderStatus::Canceled;
        if order.note.is_none() {
            order.note = note;
        }

        let key = PositionKey::new(order.account_id, order.symbol.clone());
        if let Some(mut position) = self.ledger.position(&key) {
            let mut changed = released > Decimal::ZERO;
            position.reserve(order.side, -released);
            for slot in [&mut position.take_profit_order_id, &mut position.stop_loss_order_id] {
                if *slot == Some(order.id) {
                    *slot = None;
                    changed = true;
                }
            }
            if changed {
                self.store_position(position);
            }
        }
        Ok(self.ledger.save_order(order, self.now))
    }

    // 11.3: fired by the external trigger scan
    pub(super) fn trigger_order(&mut self, order_id: OrderId) -> Result<(), EngineError> {
        let mut order = self.ledger.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Untriggered {
            return Err(EngineError::InvalidOrderStatus {
                order_id,
                status: order.status,
            });
        }
        if order.tp_sl.is_some() {
            let key = PositionKey::new(order.account_id, order.symbol.clone());
            let qty = self.ledger.position(&key).map_or(Decimal::ZERO, |p| p.current_qty);
            if reduce_only_conflicts(&order, qty) {
                self.cancel_open_order(order, Some(OrderNote::ReduceOnlyCanceled))?;
                return Ok(());
            }
            order.quantity = qty.abs();
            order.remaining = order.quantity;
        }
        order.status = OrderStatus::Pending;
        self.ledger.save_order(order, self.now);
        info!(order = order_id.0, "conditional order triggered");
        self.activate_order(order_id)
    }

    /// Untriggered orders of `symbol` whose trigger the last price has crossed.
    /// Reads committed state only.
    pub fn trigger_candidates(&self, symbol: &str) -> Vec<OrderId> {
        let Some(last) = self
            .extras
            .get(symbol)
            .and_then(|e| e.last_price.or(e.mark_price))
        else {
            return Vec::new();
        };
        let mut ids: Vec<OrderId> = self
            .ledger
            .committed_orders()
            .filter(|o| o.symbol == symbol && is_triggered(o, last))
            .map(|o| o.id)
            .collect();
        ids.sort();
        ids
    }

    // 11.4: after a fill, drop reduce-only orders the position no longer
    // allows, size TP/SL to the position and unlink finished ones.
    pub(super) fn sync_reduce_only_orders(&mut self, key: &PositionKey) -> Result<(), EngineError> {
        let qty = self.position_by_key(key)?.current_qty;
        for mut order in self.ledger.open_orders_of_account(key.account_id) {
            if order.symbol != key.symbol || !order.reduce_only {
                continue;
            }
            if reduce_only_conflicts(&order, qty) {
                self.cancel_open_order(order, Some(OrderNote::ReduceOnlyCanceled))?;
            } else if order.tp_sl.is_some() && order.status == OrderStatus::Untriggered && order.remaining != qty.abs() {
                order.quantity = qty.abs();
                order.remaining = order.quantity;
                self.ledger.save_order(order, self.now);
            }
        }

        let mut position = self.position_by_key(key)?;
        let mut changed = false;
        for slot in [&mut position.take_profit_order_id, &mut position.stop_loss_order_id] {
            let finished = slot.map_or(false, |id| self.ledger.order(id).map_or(true, |o| o.is_closed()));
            if finished {
                *slot = None;
                changed = true;
            }
        }
        if changed {
            self.ledger.save_position(position, self.now);
        }
        Ok(())
    }
}
