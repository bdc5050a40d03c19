// 7.0: engine context. built once from EngineConfig and handed to every
// component by reference; holds the insurance and bot user tables.

use crate::engine::EngineConfig;
use crate::types::UserId;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct EngineContext {
    config: EngineConfig,
    insurance_users: BTreeMap<String, UserId>,
    exempt_users: BTreeSet<UserId>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        let insurance_users = config.insurance_users.clone();
        let exempt_users = insurance_users
            .values()
            .copied()
            .chain(config.bot_users.iter().copied())
            .collect();
        Self {
            config,
            insurance_users,
            exempt_users,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// User whose account in `asset` backs liquidations.
    pub fn insurance_user(&self, asset: &str) -> Option<UserId> {
        self.insurance_users.get(asset).copied()
    }

    pub fn is_insurance_user(&self, user_id: UserId) -> bool {
        self.insurance_users.values().any(|u| *u == user_id)
    }

    pub fn is_bot(&self, user_id: UserId) -> bool {
        self.config.bot_users.contains(&user_id)
    }

    /// Insurance and bot users are never liquidated.
    pub fn is_exempt(&self, user_id: UserId) -> bool {
        self.exempt_users.contains(&user_id)
    }

    pub fn adl_enabled(&self) -> bool {
        self.config.adl_enabled
    }

    pub fn market_close_enabled(&self) -> bool {
        self.config.market_close_enabled
    }

    pub fn default_clearance_fee_rate(&self) -> Decimal {
        self.config.default_clearance_fee_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insurance_and_bots_are_exempt() {
        let mut config = EngineConfig::default();
        config.insurance_users.insert("USDT".to_string(), UserId(1));
        config.bot_users.insert(UserId(7));
        let ctx = EngineContext::new(config);

        assert_eq!(ctx.insurance_user("USDT"), Some(UserId(1)));
        assert_eq!(ctx.insurance_user("ETH"), None);
        assert!(ctx.is_exempt(UserId(1)));
        assert!(ctx.is_exempt(UserId(7)));
        assert!(ctx.is_bot(UserId(7)));
        assert!(!ctx.is_insurance_user(UserId(7)));
        assert!(!ctx.is_exempt(UserId(2)));
    }
}
