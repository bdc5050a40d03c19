//! Solvency invariants: balances never go negative, open interest nets to
//! zero, funding is zero-sum, and liquidations hand losses to the insurance
//! fund or to deleveraged counterparties without creating money.

mod common;

use common::{Harness, INSURANCE, SYMBOL};
use exchange_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const A: UserId = UserId(10);
const B: UserId = UserId(11);
const C: UserId = UserId(12);
const MAKER: UserId = UserId(20);
const MAKER_2: UserId = UserId(21);

#[derive(Debug, Clone)]
enum Action {
    Limit { user: usize, buy: bool, tenths: i64, offset: i64 },
    Market { user: usize, buy: bool, tenths: i64 },
    CancelOldest { user: usize },
    Liquidate { mark: i64 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..4usize, any::<bool>(), 1i64..20, -40i64..40)
            .prop_map(|(user, buy, tenths, offset)| Action::Limit { user, buy, tenths, offset }),
        (0..4usize, any::<bool>(), 1i64..20).prop_map(|(user, buy, tenths)| Action::Market { user, buy, tenths }),
        (0..4usize).prop_map(|user| Action::CancelOldest { user }),
        (55_000i64..75_000).prop_map(|mark| Action::Liquidate { mark }),
    ]
}

fn side(buy: bool) -> Side {
    if buy {
        Side::Buy
    } else {
        Side::Sell
    }
}

fn net_open_interest(h: &Harness) -> Decimal {
    h.engine
        .ledger()
        .positions_of_symbol(SYMBOL)
        .iter()
        .map(|p| p.current_qty)
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the order flow and marks, no wallet goes below zero and
    /// every contract bought was sold by someone.
    #[test]
    fn balances_stay_non_negative(actions in proptest::collection::vec(action_strategy(), 1..30)) {
        let users = [A, B, C, MAKER];
        let mut h = Harness::new();
        h.deposit(INSURANCE, dec!(1000000));
        for user in [A, B, C] {
            h.deposit(user, dec!(20000));
        }
        h.deposit(MAKER, dec!(1000000));

        for action in actions {
            let _ = match action {
                Action::Limit { user, buy, tenths, offset } => h.place(OrderRequest::limit(
                    users[user],
                    SYMBOL,
                    side(buy),
                    Decimal::new(tenths, 1),
                    dec!(65000) + Decimal::from(offset * 50),
                )),
                Action::Market { user, buy, tenths } => {
                    h.place(OrderRequest::market(users[user], SYMBOL, side(buy), Decimal::new(tenths, 1)))
                }
                Action::CancelOldest { user } => {
                    let account = h.account(users[user]);
                    match h.engine.open_orders(account.id).first() {
                        Some(order) => h.run(EngineCommand::CancelOrder { order_id: order.id }),
                        None => continue,
                    }
                }
                Action::Liquidate { mark } => h.run(EngineCommand::Liquidate {
                    symbol: SYMBOL.to_string(),
                    mark_price: Price::new_unchecked(Decimal::from(mark)),
                }),
            };

            for account in h.engine.accounts() {
                prop_assert!(account.balance >= Decimal::ZERO, "account {:?} went negative: {}", account.id, account.balance);
            }
            prop_assert_eq!(net_open_interest(&h), Decimal::ZERO);
        }
    }

    /// Funding moves money between longs and shorts and nowhere else.
    #[test]
    fn funding_zero_sum(rate_bps in -100i64..100, size_tenths in 1i64..50) {
        let mut h = Harness::new();
        h.deposit(A, dec!(1000000));
        h.deposit(MAKER, dec!(1000000));
        let size = Decimal::new(size_tenths, 1);
        h.limit(MAKER, Side::Sell, size, dec!(65000));
        h.market(A, Side::Buy, size);

        let before: Decimal = h.engine.accounts().iter().map(|a| a.balance).sum();
        let funding_time = h.engine.time();
        h.ok(EngineCommand::PayFunding(FundingRequest {
            symbol: SYMBOL.to_string(),
            rate: Decimal::new(rate_bps, 2),
            mark_price: Price::new_unchecked(dec!(65000)),
            funding_time,
        }));
        let after: Decimal = h.engine.accounts().iter().map(|a| a.balance).sum();
        prop_assert_eq!(before, after);

        let fees: Decimal = h.engine.ledger().funding_history().iter().map(|f| f.fee).sum();
        prop_assert_eq!(fees, Decimal::ZERO);
    }
}

#[test]
fn funding_uses_mark_and_percent_rate() {
    let mut h = Harness::new();
    h.deposit(A, dec!(100000));
    h.deposit(MAKER, dec!(100000));
    h.limit(MAKER, Side::Sell, dec!(1), dec!(65000));
    h.market(A, Side::Buy, dec!(1));

    let funding_time = h.engine.time();
    let out = h.ok(EngineCommand::PayFunding(FundingRequest {
        symbol: SYMBOL.to_string(),
        rate: dec!(0.01),
        mark_price: Price::new_unchecked(dec!(65000)),
        funding_time,
    }));
    assert_eq!(out.transactions.len(), 2);
    assert_eq!(h.account(A).balance, dec!(99993.5));
    assert_eq!(h.account(MAKER).balance, dec!(100006.5));
}

#[test]
fn funding_loss_beyond_balance_is_covered_by_insurance() {
    let mut h = Harness::new();
    h.deposit(INSURANCE, dec!(1000000));
    h.deposit(A, dec!(10000));
    h.deposit(MAKER, dec!(1000000));
    h.limit(MAKER, Side::Sell, dec!(1), dec!(65000));
    h.market(A, Side::Buy, dec!(1));

    let funding_time = h.engine.time();
    let out = h.ok(EngineCommand::PayFunding(FundingRequest {
        symbol: SYMBOL.to_string(),
        rate: dec!(50),
        mark_price: Price::new_unchecked(dec!(65000)),
        funding_time,
    }));

    assert_eq!(h.account(A).balance, Decimal::ZERO);
    assert_eq!(h.account(INSURANCE).balance, dec!(977500));
    assert_eq!(h.account(MAKER).balance, dec!(1032500));
    let covers: Vec<&Transaction> = out
        .transactions
        .iter()
        .filter(|t| t.kind == TransactionKind::ShortfallCover)
        .collect();
    assert_eq!(covers.len(), 2);
    assert_eq!(covers.iter().map(|t| t.amount).sum::<Decimal>(), Decimal::ZERO);
}

#[cfg(test)]
mod wallet {
    use super::*;

    fn wallet(user: UserId, amount: Decimal, hash: &str) -> WalletRequest {
        WalletRequest {
            user_id: user,
            asset: "USDT".to_string(),
            amount,
            hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn duplicate_deposit_hash_is_rejected() {
        let mut h = Harness::new();
        h.ok(EngineCommand::Deposit(wallet(A, dec!(100), "0xabc")));
        let err = h.run(EngineCommand::Deposit(wallet(A, dec!(100), "0xabc"))).unwrap_err();
        assert_eq!(err, EngineError::DuplicateTransaction("0xabc".to_string()));
        assert_eq!(h.account(A).balance, dec!(100));
    }

    #[test]
    fn withdrawal_cannot_touch_reserved_margin() {
        let mut h = Harness::new();
        h.deposit(A, dec!(10000));
        h.limit(A, Side::Buy, dec!(1), dec!(65000));

        let err = h.run(EngineCommand::Withdraw(wallet(A, dec!(5000), "w1"))).unwrap_err();
        assert!(err.is_insufficient_balance());
        assert_eq!(h.account(A).balance, dec!(10000));

        h.ok(EngineCommand::Withdraw(wallet(A, dec!(3000), "w2")));
        assert_eq!(h.account(A).balance, dec!(7000));
    }

    #[test]
    fn withdraw_needs_an_account() {
        let mut h = Harness::new();
        let err = h.run(EngineCommand::Withdraw(wallet(B, dec!(1), "w"))).unwrap_err();
        assert!(matches!(err, EngineError::UserAccountNotFound { .. }));
    }
}

#[cfg(test)]
mod liquidation {
    use super::*;

    /// Isolated 10x long of 1 BTC at 65000: margin 6500, bankrupt at 58500.
    fn isolated_long(h: &mut Harness, insurance: Decimal) {
        h.ok(EngineCommand::LoadTradingRule(TradingRule {
            symbol: SYMBOL.to_string(),
            clearance_fee_rate: dec!(0.001),
            max_open_orders: 0,
        }));
        h.deposit(INSURANCE, insurance);
        h.deposit(A, dec!(10000));
        h.deposit(MAKER, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(1), dec!(65000));
        h.market_isolated(A, Side::Buy, dec!(1), dec!(10));

        let position = h.position(A);
        assert_eq!(position.position_margin, dec!(6500));
        assert_eq!(position.bankrupt_price, dec!(58500));
    }

    #[test]
    fn insurance_takes_over_at_bankrupt_price() {
        let mut h = Harness::new();
        isolated_long(&mut h, dec!(1000000));

        let untouched = h.liquidate(dec!(60000));
        assert!(untouched.trades.is_empty());

        let out = h.liquidate(dec!(58000));
        assert!(out.failed_liquidations.is_empty());
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].price.value(), dec!(58500));
        assert_eq!(out.trades[0].qty, dec!(1));

        let position = h.position(A);
        assert!(position.is_empty());
        assert_eq!(position.liquidation_progress, LiquidationProgress::Normal);
        assert_eq!(position.realized_pnl, dec!(-6500));

        // clearance fee: 0.001 × 58500 × 1, as a debit/credit pair
        let fees: Vec<&Transaction> = out
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::ClearanceFee)
            .collect();
        assert_eq!(fees.len(), 2);
        assert_eq!(fees[0].account_id, h.account(A).id);
        assert_eq!(fees[0].amount, dec!(-58.5));
        assert_eq!(fees[1].account_id, h.account(INSURANCE).id);
        assert_eq!(fees[1].amount, dec!(58.5));

        assert_eq!(h.account(A).balance, dec!(3441.5));
        assert_eq!(h.account(INSURANCE).balance, dec!(1000058.5));
        let insurance = h.position(INSURANCE);
        assert_eq!(insurance.current_qty, dec!(1));
        assert_eq!(insurance.leverage, Leverage::one());
    }

    #[test]
    fn each_liquidable_position_is_settled_in_one_command() {
        let mut h = Harness::new();
        h.deposit(INSURANCE, dec!(1000000));
        h.deposit(A, dec!(10000));
        h.deposit(B, dec!(10000));
        h.deposit(MAKER, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(2), dec!(65000));
        h.market_isolated(A, Side::Buy, dec!(1), dec!(10));
        h.market_isolated(B, Side::Buy, dec!(1), dec!(10));

        let out = h.liquidate(dec!(58000));
        assert!(out.failed_liquidations.is_empty());
        assert_eq!(out.trades.len(), 2);
        assert!(h.position(A).is_empty());
        assert!(h.position(B).is_empty());
        assert_eq!(h.position(INSURANCE).current_qty, dec!(2));
        assert_eq!(net_open_interest(&h), Decimal::ZERO);
    }

    #[test]
    fn thin_insurance_falls_back_to_adl() {
        let mut h = Harness::new();
        h.ok(EngineCommand::LoadTradingRule(TradingRule {
            symbol: SYMBOL.to_string(),
            clearance_fee_rate: dec!(0.001),
            max_open_orders: 0,
        }));
        h.deposit(INSURANCE, dec!(100));
        h.deposit(A, dec!(10000));
        h.deposit(MAKER, dec!(1000000));
        h.deposit(MAKER_2, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(0.4), dec!(65000));
        h.limit(MAKER_2, Side::Sell, dec!(0.6), dec!(65000));
        h.market_isolated(A, Side::Buy, dec!(1), dec!(10));

        let out = h.liquidate(dec!(58000));
        assert!(out.failed_liquidations.is_empty());
        assert_eq!(out.trades.len(), 2);
        assert!(out.trades.iter().all(|t| t.note == Some(OrderNote::AutoDeleverage)));
        assert!(out.trades.iter().all(|t| t.price.value() == dec!(58500)));

        assert!(h.position(A).is_empty());
        assert!(h.position(MAKER).is_empty());
        assert!(h.position(MAKER_2).is_empty());
        assert_eq!(h.position(MAKER).realized_pnl, dec!(2600));
        assert_eq!(h.position(MAKER_2).realized_pnl, dec!(3900));
        assert_eq!(h.account(INSURANCE).balance, dec!(158.5));
        assert_eq!(h.engine.ranking().len(SYMBOL, PositionSide::Short), 0);
    }

    #[test]
    fn failed_unit_rolls_back_and_is_reported() {
        let mut config = EngineConfig::testnet();
        config.adl_enabled = false;
        let mut h = Harness::with(config, common::fee_free());
        isolated_long(&mut h, dec!(100));

        let out = h.liquidate(dec!(58000));
        assert!(out.trades.is_empty());
        assert_eq!(out.failed_liquidations.len(), 1);
        assert_eq!(out.failed_liquidations[0].stage, LiquidationStage::Insurance);

        let position = h.position(A);
        assert_eq!(position.current_qty, dec!(1));
        assert_eq!(position.liquidation_progress, LiquidationProgress::Normal);
        assert_eq!(h.account(INSURANCE).balance, dec!(100));
    }

    #[test]
    fn isolated_liquidation_keeps_resting_orders() {
        let mut h = Harness::new();
        isolated_long(&mut h, dec!(1000000));
        let resting = h.limit(A, Side::Buy, dec!(0.01), dec!(50000));

        let out = h.liquidate(dec!(58000));
        assert!(out.failed_liquidations.is_empty());
        assert!(h.position(A).is_empty());
        let order = h.engine.order(resting.id).unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert_eq!(order.remaining, dec!(0.01));
        assert_eq!(h.engine.open_orders(h.account(A).id).len(), 1);
    }

    #[test]
    fn partial_deleverage_is_kept_and_reported() {
        let mut config = EngineConfig::testnet();
        config.bot_users.insert(MAKER_2);
        let mut h = Harness::with(config, common::fee_free());
        h.ok(EngineCommand::LoadTradingRule(TradingRule {
            symbol: SYMBOL.to_string(),
            clearance_fee_rate: dec!(0.001),
            max_open_orders: 0,
        }));
        h.deposit(INSURANCE, dec!(100));
        h.deposit(A, dec!(10000));
        h.deposit(MAKER, dec!(1000000));
        h.deposit(MAKER_2, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(0.4), dec!(65000));
        h.limit(MAKER_2, Side::Sell, dec!(0.6), dec!(65000));
        h.market_isolated(A, Side::Buy, dec!(1), dec!(10));

        // MAKER_2 is a bot and never ranked, so only MAKER can be deleveraged
        let out = h.liquidate(dec!(58000));
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].note, Some(OrderNote::AutoDeleverage));
        assert_eq!(out.trades[0].price.value(), dec!(58500));
        assert_eq!(out.trades[0].qty, dec!(0.4));

        assert_eq!(out.failed_liquidations.len(), 1);
        assert_eq!(out.failed_liquidations[0].stage, LiquidationStage::AutoDeleverage);
        assert_eq!(out.failed_liquidations[0].position, h.position(A).key());

        let position = h.position(A);
        assert_eq!(position.current_qty, dec!(0.6));
        assert_eq!(position.liquidation_progress, LiquidationProgress::Normal);
        assert!(h.position(MAKER).is_empty());
        assert_eq!(h.position(MAKER).realized_pnl, dec!(2600));
        assert_eq!(h.position(MAKER_2).current_qty, dec!(-0.6));
        assert_eq!(h.account(INSURANCE).balance, dec!(100));
        assert_eq!(net_open_interest(&h), Decimal::ZERO);
    }

    #[test]
    fn cross_loss_chains_into_the_other_symbol() {
        const ETH: &str = "ETHUSDT";
        let mut h = Harness::new();
        h.ok(EngineCommand::UpdateInstrument(Instrument {
            symbol: ETH.to_string(),
            base_asset: "ETH".to_string(),
            ..common::fee_free()
        }));
        for rule in RuleIndex::standard_tiers(ETH) {
            h.ok(EngineCommand::LoadLeverageMarginRule(rule));
        }
        h.set_mark(ETH, dec!(3000));

        h.deposit(INSURANCE, dec!(1000000));
        h.deposit(A, dec!(10000));
        h.deposit(MAKER, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(1), dec!(65000));
        h.market(A, Side::Buy, dec!(1));
        h.place(OrderRequest::limit(MAKER, ETH, Side::Sell, dec!(10), dec!(3000))).unwrap();
        h.place(OrderRequest::market(A, ETH, Side::Buy, dec!(10))).unwrap();

        let account = h.account(A).id;
        assert_eq!(h.engine.position(account, ETH).unwrap().current_qty, dec!(10));

        // BTC goes at 55000 and takes the whole wallet, which drags ETH under
        let out = h.liquidate(dec!(50000));
        assert!(out.failed_liquidations.is_empty());
        assert_eq!(out.trades.len(), 2);
        assert_eq!(out.trades[0].symbol, SYMBOL);
        assert_eq!(out.trades[0].price.value(), dec!(55000));
        assert_eq!(out.trades[1].symbol, ETH);
        assert_eq!(out.trades[1].price.value(), dec!(3000));

        assert!(h.position(A).is_empty());
        assert!(h.engine.position(account, ETH).unwrap().is_empty());
        assert_eq!(h.account(A).balance, Decimal::ZERO);

        let insurance = h.account(INSURANCE).id;
        assert_eq!(h.position(INSURANCE).current_qty, dec!(1));
        assert_eq!(h.engine.position(insurance, ETH).unwrap().current_qty, dec!(10));
    }

    #[test]
    fn cross_clearance_fee_is_capped_at_what_is_left() {
        let mut h = Harness::new();
        h.deposit(INSURANCE, dec!(1000000));
        h.deposit(A, dec!(7000));
        h.deposit(MAKER, dec!(1000000));
        h.limit(MAKER, Side::Sell, dec!(1), dec!(65000));
        h.market(A, Side::Buy, dec!(1));
        assert_eq!(h.position(A).bankrupt_price, dec!(58000));

        let out = h.liquidate(dec!(57900));
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].price.value(), dec!(58000));
        assert!(out.transactions.iter().all(|t| t.kind != TransactionKind::ClearanceFee));
        assert_eq!(h.account(A).balance, Decimal::ZERO);
        assert!(h.position(A).is_empty());
    }
}
