//! Price-time matching and trade settlement.

use super::core::Engine;
use super::results::EngineError;
use crate::conditional::reducible_quantity;
use crate::history::{MarginChange, Trade};
use crate::instrument::Instrument;
use crate::margin::prorate;
use crate::order::{Order, OrderNote};
use crate::types::{OrderId, PositionKey, Price, Side, TradeId};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// One side of a trade on its way into the position.
struct FillLeg<'a> {
    order: &'a Order,
    fee: Decimal,
    released: Decimal,
}

impl Engine {
    // 12.1: walk the opposite side best price first, oldest order first
    pub(super) fn match_order(&mut self, taker_id: OrderId, instrument: &Instrument) -> Result<(), EngineError> {
        loop {
            let taker = self.ledger.order(taker_id).ok_or(EngineError::OrderNotFound(taker_id))?;
            if !taker.is_open() || taker.remaining <= Decimal::ZERO {
                break;
            }
            let maker_side = taker.side.opposite();
            let Some((maker_id, maker_price, resting)) = self.ledger.book(&taker.symbol).and_then(|b| b.front(maker_side))
            else {
                break;
            };
            if !taker.crosses(maker_price) {
                break;
            }

            let mut qty = taker.remaining.min(resting);
            if taker.reduce_only {
                qty = qty.min(reducible_quantity(&taker, self.position_qty(&taker)));
                if qty <= Decimal::ZERO {
                    break;
                }
            }

            let maker = match self.ledger.order(maker_id) {
                Some(maker) if maker.is_open() => maker,
                _ => {
                    warn!(order = maker_id.0, symbol = %taker.symbol, "dropping stale book entry");
                    self.ledger.book_mut(&taker.symbol).remove(maker_side, maker_price, maker_id);
                    continue;
                }
            };
            if maker.reduce_only {
                let reducible = reducible_quantity(&maker, self.position_qty(&maker));
                if reducible <= Decimal::ZERO {
                    self.cancel_open_order(maker, Some(OrderNote::ReduceOnlyCanceled))?;
                    continue;
                }
                qty = qty.min(reducible);
            }

            self.execute_trade(taker, maker, maker_price, qty, instrument, true)?;
        }
        Ok(())
    }

    fn position_qty(&self, order: &Order) -> Decimal {
        self.ledger
            .position(&PositionKey::new(order.account_id, order.symbol.clone()))
            .map_or(Decimal::ZERO, |p| p.current_qty)
    }

    /// Fill `qty` between two orders at `price` and settle both positions,
    /// buyer first. `maker_on_book` is false for engine orders matched directly.
    pub(super) fn execute_trade(
        &mut self,
        mut taker: Order,
        mut maker: Order,
        price: Price,
        qty: Decimal,
        instrument: &Instrument,
        maker_on_book: bool,
    ) -> Result<Trade, EngineError> {
        let calc = self.calculator(instrument, price);
        let taker_fee = if taker.is_system() {
            Decimal::ZERO
        } else {
            calc.fee(qty, price.value(), instrument.taker_fee_rate)
        };
        let maker_fee = if maker.is_system() {
            Decimal::ZERO
        } else {
            calc.fee(qty, price.value(), instrument.maker_fee_rate)
        };

        let taker_released = prorate(taker.reserved, qty, taker.remaining);
        let maker_released = prorate(maker.reserved, qty, maker.remaining);
        taker.reserved -= taker_released;
        maker.reserved -= maker_released;
        taker.fill(qty, price.value());
        maker.fill(qty, price.value());
        if maker_on_book {
            self.ledger.book_mut(&maker.symbol).fill(maker.side, price, maker.id, qty);
        }
        let taker = self.ledger.save_order(taker, self.now);
        let maker = self.ledger.save_order(maker, self.now);

        let taker_leg = FillLeg {
            order: &taker,
            fee: taker_fee,
            released: taker_released,
        };
        let maker_leg = FillLeg {
            order: &maker,
            fee: maker_fee,
            released: maker_released,
        };
        let (buy_leg, sell_leg, taker_is_buyer) = match taker.side {
            Side::Buy => (taker_leg, maker_leg, true),
            Side::Sell => (maker_leg, taker_leg, false),
        };
        let buy_pnl = self.settle_fill(&buy_leg, qty, price, instrument)?;
        let sell_pnl = self.settle_fill(&sell_leg, qty, price, instrument)?;
        let (taker_pnl, maker_pnl) = if taker_is_buyer {
            (buy_pnl, sell_pnl)
        } else {
            (sell_pnl, buy_pnl)
        };

        let trade = Trade {
            id: TradeId(0),
            symbol: taker.symbol.clone(),
            price,
            qty,
            taker_side: taker.side,
            taker_order_id: taker.id,
            maker_order_id: maker.id,
            taker_account_id: taker.account_id,
            maker_account_id: maker.account_id,
            taker_fee,
            maker_fee,
            taker_realized_pnl: taker_pnl,
            maker_realized_pnl: maker_pnl,
            note: taker.note.or(maker.note),
            created_at: self.now,
        };
        let trade = self.ledger.insert_trade(trade, self.now)?;
        debug!(
            trade = trade.id.0,
            symbol = %trade.symbol,
            %price,
            %qty,
            taker = taker.id.0,
            maker = maker.id.0,
            "trade executed"
        );
        Ok(trade)
    }

    // 12.2: one leg: release the filled share of the reservation, move the
    // position, then book realized pnl net of fees into the wallet.
    fn settle_fill(&mut self, leg: &FillLeg<'_>, qty: Decimal, price: Price, instrument: &Instrument) -> Result<Decimal, EngineError> {
        let order = leg.order;
        let key = PositionKey::new(order.account_id, order.symbol.clone());
        let mut position = self.position_by_key(&key)?;
        position.reserve(order.side, -leg.released);

        let margin_before = position.position_margin + position.adjust_margin;
        let calc = self.calculator(instrument, price);
        let outcome = position.apply_fill(&calc, order.side, qty, price.value());
        let position = self.store_position(position);

        self.record_position_history(&position)?;
        if position.is_isolated() {
            let margin_after = position.position_margin + position.adjust_margin;
            self.record_margin_history(&position, MarginChange::Trade, margin_after - margin_before)?;
        }
        self.apply_balance_change(order.account_id, outcome.realized_pnl - leg.fee)?;
        self.sync_reduce_only_orders(&key)?;
        Ok(outcome.realized_pnl)
    }
}
