//! Command stream.
//!
//! Every state change enters through [`Engine::process`]. A command either
//! commits all of its writes or none of them; the only exception is
//! `Liquidate`, which commits each liquidated position as its own unit and
//! reports the units that failed instead of aborting.

use super::core::Engine;
use super::results::EngineError;
use crate::events::CommandOutput;
use crate::instrument::{Instrument, InstrumentExtra};
use crate::ledger::IdSeeds;
use crate::order::{OrderType, TimeInForce, TpSl};
use crate::rules::{LeverageMarginRule, TradingRule};
use crate::types::{MarginMode, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// Switches the position's mode when it is flat. `None` keeps it.
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub tp_sl: Option<TpSl>,
}

impl OrderRequest {
    pub fn limit(user_id: UserId, symbol: impl Into<String>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            user_id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
            price: Some(price),
            quantity,
            margin_mode: None,
            leverage: None,
            reduce_only: false,
            post_only: false,
            trigger_price: None,
            tp_sl: None,
        }
    }

    pub fn market(user_id: UserId, symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            order_type: OrderType::Market,
            time_in_force: TimeInForce::IOC,
            price: None,
            ..Self::limit(user_id, symbol, side, quantity, Decimal::ZERO)
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRequest {
    pub user_id: UserId,
    pub asset: String,
    pub amount: Decimal,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageRequest {
    pub user_id: UserId,
    pub symbol: String,
    pub leverage: Decimal,
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
}

/// Signed top-up (positive) or withdrawal (negative) of isolated margin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRequest {
    pub user_id: UserId,
    pub symbol: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub symbol: String,
    /// Funding rate in percent
    pub rate: Decimal,
    pub mark_price: Price,
    pub funding_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineCommand {
    PlaceOrder(OrderRequest),
    CancelOrder { order_id: OrderId },
    TriggerOrder { order_id: OrderId },
    Deposit(WalletRequest),
    Withdraw(WalletRequest),
    AdjustLeverage(LeverageRequest),
    AdjustMarginPosition(MarginRequest),
    Liquidate { symbol: String, mark_price: Price },
    PayFunding(FundingRequest),
    LoadTradingRule(TradingRule),
    LoadLeverageMarginRule(LeverageMarginRule),
    UpdateInstrument(Instrument),
    UpdateInstrumentExtra(InstrumentExtra),
    InitializeEngine(IdSeeds),
    RefillReservedIds { ids: Vec<u64> },
    StartEngine,
    StopEngine,
}

impl EngineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::PlaceOrder(_) => "place_order",
            EngineCommand::CancelOrder { .. } => "cancel_order",
            EngineCommand::TriggerOrder { .. } => "trigger_order",
            EngineCommand::Deposit(_) => "deposit",
            EngineCommand::Withdraw(_) => "withdraw",
            EngineCommand::AdjustLeverage(_) => "adjust_leverage",
            EngineCommand::AdjustMarginPosition(_) => "adjust_margin_position",
            EngineCommand::Liquidate { .. } => "liquidate",
            EngineCommand::PayFunding(_) => "pay_funding",
            EngineCommand::LoadTradingRule(_) => "load_trading_rule",
            EngineCommand::LoadLeverageMarginRule(_) => "load_leverage_margin_rule",
            EngineCommand::UpdateInstrument(_) => "update_instrument",
            EngineCommand::UpdateInstrumentExtra(_) => "update_instrument_extra",
            EngineCommand::InitializeEngine(_) => "initialize_engine",
            EngineCommand::RefillReservedIds { .. } => "refill_reserved_ids",
            EngineCommand::StartEngine => "start_engine",
            EngineCommand::StopEngine => "stop_engine",
        }
    }

    /// Commands that touch the ledger. They need a started engine.
    pub fn is_trading(&self) -> bool {
        matches!(
            self,
            EngineCommand::PlaceOrder(_)
                | EngineCommand::CancelOrder { .. }
                | EngineCommand::TriggerOrder { .. }
                | EngineCommand::Deposit(_)
                | EngineCommand::Withdraw(_)
                | EngineCommand::AdjustLeverage(_)
                | EngineCommand::AdjustMarginPosition(_)
                | EngineCommand::Liquidate { .. }
                | EngineCommand::PayFunding(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub timestamp: Timestamp,
    pub command: EngineCommand,
}

impl CommandEnvelope {
    pub fn new(timestamp: Timestamp, command: EngineCommand) -> Self {
        Self { timestamp, command }
    }
}

impl Engine {
    /// Apply one command. On error nothing the command staged survives.
    pub fn process(&mut self, envelope: CommandEnvelope) -> Result<CommandOutput, EngineError> {
        let CommandEnvelope { timestamp, command } = envelope;
        let name = command.name();
        self.now = self.now.max(timestamp);
        self.reap_expired();

        debug!(command = name, at = %self.now, "processing command");
        match self.dispatch(command) {
            Ok(()) => {
                if self.ledger.has_pending() {
                    self.commit();
                }
                Ok(self.take_output())
            }
            Err(err) => {
                self.rollback();
                self.take_output();
                warn!(command = name, error = %err, "command rejected");
                Err(err)
            }
        }
    }

    fn dispatch(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        if command.is_trading() && !self.started {
            return Err(EngineError::EngineNotStarted);
        }
        match command {
            EngineCommand::PlaceOrder(request) => self.place_order(request).map(|_| ()),
            EngineCommand::CancelOrder { order_id } => self.cancel_order(order_id),
            EngineCommand::TriggerOrder { order_id } => self.trigger_order(order_id),
            EngineCommand::Deposit(request) => self.deposit(request),
            EngineCommand::Withdraw(request) => self.withdraw(request),
            EngineCommand::AdjustLeverage(request) => self.adjust_leverage(request),
            EngineCommand::AdjustMarginPosition(request) => self.adjust_margin_position(request),
            EngineCommand::Liquidate { symbol, mark_price } => self.liquidate(&symbol, mark_price),
            EngineCommand::PayFunding(request) => self.pay_funding(request),
            EngineCommand::LoadTradingRule(rule) => {
                self.rules.load_trading_rule(rule);
                Ok(())
            }
            EngineCommand::LoadLeverageMarginRule(rule) => Ok(self.rules.load_leverage_margin_rule(rule)?),
            EngineCommand::UpdateInstrument(instrument) => self.update_instrument(instrument),
            EngineCommand::UpdateInstrumentExtra(extra) => self.update_instrument_extra(extra),
            EngineCommand::InitializeEngine(seeds) => {
                self.initialize(seeds);
                Ok(())
            }
            EngineCommand::RefillReservedIds { ids } => {
                self.refill_reserved_ids(ids);
                Ok(())
            }
            EngineCommand::StartEngine => self.start(),
            EngineCommand::StopEngine => {
                self.stop();
                Ok(())
            }
        }
    }
}
