//! Instrument metadata and the out-of-band market data attached to it.
//!
//! An instrument is static: contract type, multiplier, tick/lot size, fees.
//! Prices move far more often and live in a separate [`InstrumentExtra`]
//! record that is replaced wholesale, never staged.

use crate::types::{ContractType, Price, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Asset the margin and PnL are denominated in
    pub settle_asset: String,
    pub contract_type: ContractType,
    /// Contract face value. 1 for linear contracts.
    pub multiplier: Decimal,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub taker_fee_rate: Decimal,
    pub maker_fee_rate: Decimal,
}

impl Instrument {
    /// USD-margined BTC perpetual.
    pub fn btc_usdt() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            settle_asset: "USDT".to_string(),
            contract_type: ContractType::Linear,
            multiplier: Decimal::ONE,
            tick_size: dec!(0.1),
            lot_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            taker_fee_rate: dec!(0.0005),
            maker_fee_rate: dec!(0.0002),
        }
    }

    /// Coin-margined BTC perpetual, 100 USD per contract.
    pub fn btc_usd_inverse() -> Self {
        Self {
            symbol: "BTCUSD".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USD".to_string(),
            settle_asset: "BTC".to_string(),
            contract_type: ContractType::Inverse,
            multiplier: dec!(100),
            tick_size: dec!(0.5),
            lot_size: Decimal::ONE,
            min_qty: Decimal::ONE,
            max_qty: dec!(1000000),
            taker_fee_rate: dec!(0.0005),
            maker_fee_rate: dec!(0.0002),
        }
    }

    pub fn is_inverse(&self) -> bool {
        self.contract_type == ContractType::Inverse
    }

    /// Multiplier used by the margin formulas: 1 for linear contracts.
    pub fn effective_multiplier(&self) -> Decimal {
        match self.contract_type {
            ContractType::Linear => Decimal::ONE,
            ContractType::Inverse => self.multiplier,
        }
    }

    pub fn validate_size(&self, size: Decimal) -> Result<(), InstrumentError> {
        if size < self.min_qty {
            return Err(InstrumentError::OrderTooSmall {
                size,
                minimum: self.min_qty,
            });
        }
        if size > self.max_qty {
            return Err(InstrumentError::OrderTooLarge {
                size,
                maximum: self.max_qty,
            });
        }
        if !self.lot_size.is_zero() && !(size % self.lot_size).is_zero() {
            return Err(InstrumentError::InvalidLotSize {
                size,
                lot_size: self.lot_size,
            });
        }
        Ok(())
    }

    /// Round a price to the nearest tick.
    pub fn validate_price(&self, price: Decimal) -> Result<Price, InstrumentError> {
        if price <= Decimal::ZERO {
            return Err(InstrumentError::InvalidPrice(price));
        }
        if self.tick_size.is_zero() {
            return Ok(Price::new_unchecked(price));
        }
        let rounded = (price / self.tick_size).round() * self.tick_size;
        Price::new(rounded).ok_or(InstrumentError::InvalidPrice(price))
    }

    pub fn validate(&self) -> Result<(), InstrumentError> {
        if self.multiplier <= Decimal::ZERO {
            return Err(InstrumentError::InvalidMultiplier(self.multiplier));
        }
        if self.min_qty > self.max_qty {
            return Err(InstrumentError::OrderTooLarge {
                size: self.min_qty,
                maximum: self.max_qty,
            });
        }
        Ok(())
    }
}

/// Frequently changing market data for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentExtra {
    pub symbol: String,
    pub last_price: Option<Price>,
    pub mark_price: Option<Price>,
    pub oracle_price: Option<Price>,
    /// Last funding rate in percent
    pub funding_rate: Decimal,
    pub updated_at: Timestamp,
}

impl InstrumentExtra {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstrumentError {
    #[error("Order size {size} below minimum {minimum}")]
    OrderTooSmall { size: Decimal, minimum: Decimal },

    #[error("Order size {size} above maximum {maximum}")]
    OrderTooLarge { size: Decimal, maximum: Decimal },

    #[error("Order size {size} not aligned to lot size {lot_size}")]
    InvalidLotSize { size: Decimal, lot_size: Decimal },

    #[error("Invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("Invalid contract multiplier {0}")]
    InvalidMultiplier(Decimal),
}
