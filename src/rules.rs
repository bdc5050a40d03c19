// 3.0: trading rules. static per-symbol settings plus notional-tiered
// maintenance margin rules. tiers are looked up by notional value through an
// interval map keyed on each tier's floor; the highest tier is the fallback.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRule {
    pub symbol: String,
    pub clearance_fee_rate: Decimal,
    pub max_open_orders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageMarginRule {
    pub symbol: String,
    pub tier: u32,
    /// Inclusive lower bound of the notional range
    pub notional_floor: Decimal,
    /// Exclusive upper bound of the notional range
    pub notional_cap: Decimal,
    pub max_leverage: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub maintenance_amount: Decimal,
}

impl LeverageMarginRule {
    pub fn contains(&self, notional: Decimal) -> bool {
        notional >= self.notional_floor && notional < self.notional_cap
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.notional_floor < Decimal::ZERO || self.notional_floor >= self.notional_cap {
            return Err(RuleError::InvalidRange {
                symbol: self.symbol.clone(),
                tier: self.tier,
            });
        }
        if self.max_leverage < Decimal::ONE {
            return Err(RuleError::InvalidLeverage(self.max_leverage));
        }
        if self.maintenance_margin_rate < Decimal::ZERO || self.maintenance_margin_rate >= Decimal::ONE {
            return Err(RuleError::InvalidMaintenanceRate(self.maintenance_margin_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("Tier {tier} of {symbol} has an empty notional range")]
    InvalidRange { symbol: String, tier: u32 },

    #[error("Max leverage {0} below 1x")]
    InvalidLeverage(Decimal),

    #[error("Maintenance margin rate {0} outside [0, 1)")]
    InvalidMaintenanceRate(Decimal),
}

#[derive(Debug, Clone, Default)]
struct SymbolTiers {
    by_floor: BTreeMap<Decimal, LeverageMarginRule>,
}

impl SymbolTiers {
    fn insert(&mut self, rule: LeverageMarginRule) {
        // reloading a tier replaces it even if its floor moved
        self.by_floor.retain(|_, r| r.tier != rule.tier);
        self.by_floor.insert(rule.notional_floor, rule);
    }

    fn lookup(&self, notional: Decimal) -> Option<&LeverageMarginRule> {
        self.by_floor
            .range(..=notional)
            .next_back()
            .map(|(_, rule)| rule)
            .filter(|rule| rule.contains(notional))
            .or_else(|| self.highest())
    }

    fn highest(&self) -> Option<&LeverageMarginRule> {
        self.by_floor.values().next_back()
    }

    fn max_leverage(&self) -> Option<Decimal> {
        self.by_floor.values().map(|r| r.max_leverage).max()
    }
}

/// 3.1: per-symbol rule lookup.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    trading: HashMap<String, TradingRule>,
    tiers: HashMap<String, SymbolTiers>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_trading_rule(&mut self, rule: TradingRule) {
        self.trading.insert(rule.symbol.clone(), rule);
    }

    pub fn load_leverage_margin_rule(&mut self, rule: LeverageMarginRule) -> Result<(), RuleError> {
        rule.validate()?;
        self.tiers.entry(rule.symbol.clone()).or_default().insert(rule);
        Ok(())
    }

    pub fn trading_rule(&self, symbol: &str) -> Option<&TradingRule> {
        self.trading.get(symbol)
    }

    pub fn clearance_fee_rate(&self, symbol: &str, default_rate: Decimal) -> Decimal {
        self.trading
            .get(symbol)
            .map(|r| r.clearance_fee_rate)
            .unwrap_or(default_rate)
    }

    /// Tier whose notional range holds `notional`, else the highest tier.
    pub fn tier_for(&self, symbol: &str, notional: Decimal) -> Option<&LeverageMarginRule> {
        self.tiers.get(symbol).and_then(|t| t.lookup(notional.abs()))
    }

    pub fn default_tier(&self, symbol: &str) -> Option<&LeverageMarginRule> {
        self.tiers.get(symbol).and_then(|t| t.highest())
    }

    /// Highest leverage any tier of the symbol allows.
    pub fn max_leverage(&self, symbol: &str) -> Option<Decimal> {
        self.tiers.get(symbol).and_then(|t| t.max_leverage())
    }

    /// Default ladder used by the demo and tests.
    pub fn standard_tiers(symbol: &str) -> Vec<LeverageMarginRule> {
        let rows = [
            (1, dec!(0), dec!(50000), dec!(100), dec!(0.005), dec!(0)),
            (2, dec!(50000), dec!(250000), dec!(50), dec!(0.01), dec!(250)),
            (3, dec!(250000), dec!(1000000), dec!(20), dec!(0.025), dec!(4000)),
            (4, dec!(1000000), Decimal::MAX, dec!(10), dec!(0.05), dec!(29000)),
        ];
        rows.into_iter()
            .map(|(tier, floor, cap, lev, mmr, amt)| LeverageMarginRule {
                symbol: symbol.to_string(),
                tier,
                notional_floor: floor,
                notional_cap: cap,
                max_leverage: lev,
                maintenance_margin_rate: mmr,
                maintenance_amount: amt,
            })
            .collect()
    }
}
