// 8.0.2: engine errors. per-layer errors fold in through #[from].

use super::config::ConfigError;
use crate::instrument::InstrumentError;
use crate::order::OrderStatus;
use crate::rules::RuleError;
use crate::store::StoreError;
use crate::types::{AccountId, OrderId, PositionKey, UserId};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Account {0:?} not found")]
    AccountNotFound(AccountId),

    #[error("No {asset} account for user {user_id:?}")]
    UserAccountNotFound { user_id: UserId, asset: String },

    #[error("Instrument {0} not found")]
    InstrumentNotFound(String),

    #[error("Order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("Insufficient balance on account {account_id:?}: available {available}")]
    InsufficientBalance { account_id: AccountId, available: Decimal },

    #[error("Duplicate transaction hash {0}")]
    DuplicateTransaction(String),

    #[error("Order {order_id:?} is {status:?}")]
    InvalidOrderStatus { order_id: OrderId, status: OrderStatus },

    #[error("No lock price for market order on {0}: opposite book is empty")]
    LockPriceUnavailable(String),

    #[error("No insurance account mapped for {0}")]
    InsuranceAccountMissing(String),

    #[error("No mark price available for {0}")]
    NoMarkPrice(String),

    #[error("Position {position} cannot be changed: {reason}")]
    InvalidPositionState { position: PositionKey, reason: String },

    #[error("Leverage {leverage} outside [1, {max}] for {symbol}")]
    InvalidLeverage { symbol: String, leverage: Decimal, max: Decimal },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Engine is not started")]
    EngineNotStarted,

    #[error("Engine id sequences are not initialized")]
    EngineNotInitialized,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// The one failure liquidation recovers from by falling through to the next stage.
    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, EngineError::InsufficientBalance { .. })
    }
}
