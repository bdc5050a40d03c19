// 4.0: position tracking. one position per (account, symbol), created lazily on
// the first order. quantity is signed, entry value is signed (see margin.rs).
// 4.1 applies one fill: reduce first, then open whatever is left.

use crate::liquidation::LiquidationProgress;
use crate::margin::MarginCalculator;
use crate::store::Entity;
use crate::types::{AccountId, Leverage, MarginMode, OrderId, PositionId, PositionKey, PositionSide, Side, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub symbol: String,
    /// Settle asset of the instrument
    pub asset: String,
    pub current_qty: Decimal,
    pub entry_price: Decimal,
    pub entry_value: Decimal,
    pub position_margin: Decimal,
    /// Manual top-up or withdrawal of isolated margin
    pub adjust_margin: Decimal,
    pub mar_buy: Decimal,
    pub mar_sel: Decimal,
    pub order_cost: Decimal,
    pub maintenance_margin: Decimal,
    pub liquidation_price: Decimal,
    pub bankrupt_price: Decimal,
    pub tmp_total_fee: Decimal,
    pub pnl_ranking: Decimal,
    pub liquidation_progress: LiquidationProgress,
    pub margin_mode: MarginMode,
    pub leverage: Leverage,
    pub take_profit_order_id: Option<OrderId>,
    pub stop_loss_order_id: Option<OrderId>,
    pub realized_pnl: Decimal,
    pub close_size: Decimal,
    pub avg_close_price: Decimal,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn new(
        account_id: AccountId,
        symbol: impl Into<String>,
        asset: impl Into<String>,
        margin_mode: MarginMode,
        leverage: Leverage,
    ) -> Self {
        Self {
            id: PositionId(0),
            account_id,
            symbol: symbol.into(),
            asset: asset.into(),
            current_qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            entry_value: Decimal::ZERO,
            position_margin: Decimal::ZERO,
            adjust_margin: Decimal::ZERO,
            mar_buy: Decimal::ZERO,
            mar_sel: Decimal::ZERO,
            order_cost: Decimal::ZERO,
            maintenance_margin: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
            bankrupt_price: Decimal::ZERO,
            tmp_total_fee: Decimal::ZERO,
            pnl_ranking: Decimal::ZERO,
            liquidation_progress: LiquidationProgress::Normal,
            margin_mode,
            leverage,
            take_profit_order_id: None,
            stop_loss_order_id: None,
            realized_pnl: Decimal::ZERO,
            close_size: Decimal::ZERO,
            avg_close_price: Decimal::ZERO,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.account_id, self.symbol.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.current_qty.is_zero()
    }

    pub fn side(&self) -> Option<PositionSide> {
        PositionSide::of(self.current_qty)
    }

    pub fn is_isolated(&self) -> bool {
        self.margin_mode == MarginMode::Isolated
    }

    pub fn is_liquidating(&self) -> bool {
        self.liquidation_progress == LiquidationProgress::Liquidating
    }

    pub fn reservation(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.mar_buy,
            Side::Sell => self.mar_sel,
        }
    }

    /// Add (or with a negative amount, release) reserved margin on one side.
    pub fn reserve(&mut self, side: Side, amount: Decimal) {
        let slot = match side {
            Side::Buy => &mut self.mar_buy,
            Side::Sell => &mut self.mar_sel,
        };
        *slot = (*slot + amount).max(Decimal::ZERO);
        self.order_cost = self.mar_buy.max(self.mar_sel);
    }

    // 4.1: apply one fill on `side`. closes against the current quantity first,
    // the remainder (if any) opens the other way.
    pub fn apply_fill(&mut self, calc: &MarginCalculator<'_>, side: Side, qty: Decimal, price: Decimal) -> FillOutcome {
        let mut outcome = FillOutcome::default();
        let old_qty = self.current_qty;
        let mut left = qty;

        if Side::closing(old_qty) == Some(side) {
            let close = left.min(old_qty.abs());
            let realized = calc.realized_pnl(old_qty, self.entry_value, close, price);
            let released = calc.close_value(old_qty, self.entry_value, close);
            let remaining = old_qty.abs() - close;

            self.entry_value -= released;
            if self.is_isolated() {
                self.position_margin = self.position_margin * remaining / old_qty.abs();
            }
            let closed_before = self.close_size;
            self.close_size += close;
            self.avg_close_price = (self.avg_close_price * closed_before + price * close) / self.close_size;
            self.realized_pnl += realized;
            self.current_qty += side.sign() * close;

            outcome.realized_pnl = realized;
            outcome.closed = close;
            left -= close;
            if self.current_qty.is_zero() {
                self.reset_flat();
                outcome.crossed_zero = true;
            }
        }

        if left > Decimal::ZERO {
            let delta = side.sign() * left;
            self.entry_value += calc.entry_value_delta(delta, price);
            if self.is_isolated() {
                self.position_margin += calc.open_margin(left, price, self.leverage.value());
            }
            self.current_qty += delta;
            outcome.opened = left;
        }

        self.entry_price = calc.entry_price(self.current_qty, self.entry_value);
        outcome
    }

    /// Zero everything tied to an open quantity. Reservations of resting
    /// orders survive.
    pub fn reset_flat(&mut self) {
        self.current_qty = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;
        self.entry_value = Decimal::ZERO;
        self.position_margin = Decimal::ZERO;
        self.adjust_margin = Decimal::ZERO;
        self.maintenance_margin = Decimal::ZERO;
        self.liquidation_price = Decimal::ZERO;
        self.bankrupt_price = Decimal::ZERO;
        self.tmp_total_fee = Decimal::ZERO;
        self.pnl_ranking = Decimal::ZERO;
        self.close_size = Decimal::ZERO;
        self.avg_close_price = Decimal::ZERO;
    }
}

impl Entity for Position {
    type Key = PositionKey;

    fn key(&self) -> PositionKey {
        Position::key(self)
    }

    fn assign_id(&mut self, id: u64) {
        self.id = PositionId(id);
    }

    fn stamp(&mut self, now: Timestamp, created: bool) {
        if created {
            self.created_at = now;
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillOutcome {
    pub realized_pnl: Decimal,
    pub closed: Decimal,
    pub opened: Decimal,
    /// Position went through (or to) zero during the fill
    pub crossed_zero: bool,
}
