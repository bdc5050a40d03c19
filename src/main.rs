//! Exchange core simulation.
//!
//! With a file argument, replays JSON-lines command envelopes through the
//! engine and prints each command's output. Without one, runs a scripted
//! session: order matching, funding, and a liquidation taken over by the
//! insurance fund.

use exchange_core::*;
use rust_decimal_macros::dec;
use std::io::BufRead;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRADER_A: UserId = UserId(100);
const TRADER_B: UserId = UserId(101);
const MAKER: UserId = UserId(102);

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exchange_core=info,exchange_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut engine = match Engine::new(EngineConfig::testnet()) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "invalid engine config");
            std::process::exit(1);
        }
    };

    match std::env::args().nth(1) {
        Some(path) => replay(&mut engine, &path),
        None => scripted_session(&mut engine),
    }
}

fn replay(engine: &mut Engine, path: &str) {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            error!(path, error = %err, "cannot open command file");
            std::process::exit(1);
        }
    };
    let (mut applied, mut rejected) = (0usize, 0usize);
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) if !line.trim().is_empty() => line,
            Ok(_) => continue,
            Err(err) => {
                error!(line = line_no + 1, error = %err, "read failed");
                break;
            }
        };
        let envelope: CommandEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(line = line_no + 1, error = %err, "malformed command");
                rejected += 1;
                continue;
            }
        };
        match engine.process(envelope) {
            Ok(output) => {
                applied += 1;
                report(&output);
            }
            Err(_) => rejected += 1,
        }
    }
    info!(applied, rejected, "replay finished");
}

fn report(output: &CommandOutput) {
    if output.is_empty() {
        return;
    }
    match serde_json::to_string(output) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "output not serializable"),
    }
}

/// Feed one command, logging a rejection instead of stopping the session.
fn step(engine: &mut Engine, clock: &mut i64, command: EngineCommand) -> Option<CommandOutput> {
    *clock += 1_000;
    let output = engine
        .process(CommandEnvelope::new(Timestamp::from_millis(*clock), command))
        .ok()?;
    report(&output);
    Some(output)
}

fn scripted_session(engine: &mut Engine) {
    let mut clock = Timestamp::now().as_millis();
    let symbol = "BTCUSDT";

    println!("Session setup\n");
    step(engine, &mut clock, EngineCommand::InitializeEngine(IdSeeds::default()));
    step(engine, &mut clock, EngineCommand::RefillReservedIds {
        ids: (1_000_000..1_000_100).collect(),
    });
    step(engine, &mut clock, EngineCommand::UpdateInstrument(Instrument::btc_usdt()));
    for rule in RuleIndex::standard_tiers(symbol) {
        step(engine, &mut clock, EngineCommand::LoadLeverageMarginRule(rule));
    }
    step(engine, &mut clock, EngineCommand::StartEngine);

    let insurance = engine.context().insurance_user("USDT").unwrap_or(UserId(1));
    for (user, amount) in [(insurance, dec!(1000000)), (TRADER_A, dec!(10000)), (TRADER_B, dec!(10000)), (MAKER, dec!(500000))] {
        step(engine, &mut clock, EngineCommand::Deposit(WalletRequest {
            user_id: user,
            asset: "USDT".to_string(),
            amount,
            hash: Some(format!("seed-{}", user.0)),
        }));
    }

    println!("\nMatching\n");
    step(engine, &mut clock, EngineCommand::PlaceOrder(OrderRequest::limit(MAKER, symbol, Side::Sell, dec!(1), dec!(65000))));
    step(engine, &mut clock, EngineCommand::PlaceOrder(OrderRequest::limit(MAKER, symbol, Side::Buy, dec!(1), dec!(64900))));
    let mut isolated = OrderRequest::market(TRADER_A, symbol, Side::Buy, dec!(1));
    isolated.margin_mode = Some(MarginMode::Isolated);
    isolated.leverage = Some(dec!(20));
    step(engine, &mut clock, EngineCommand::PlaceOrder(isolated));
    step(engine, &mut clock, EngineCommand::PlaceOrder(OrderRequest::market(TRADER_B, symbol, Side::Sell, dec!(0.5))));

    if let Some(account) = engine.account_for(TRADER_A, "USDT") {
        if let Some(position) = engine.position(account.id, symbol) {
            println!(
                "  trader A: {} @ {}, liquidation {}, bankrupt {}",
                position.current_qty, position.entry_price, position.liquidation_price, position.bankrupt_price
            );
        }
    }

    println!("\nFunding\n");
    let funding_time = Timestamp::from_millis(clock);
    step(engine, &mut clock, EngineCommand::PayFunding(FundingRequest {
        symbol: symbol.to_string(),
        rate: dec!(0.01),
        mark_price: Price::new_unchecked(dec!(65000)),
        funding_time,
    }));

    println!("\nLiquidation\n");
    if let Some(output) = step(engine, &mut clock, EngineCommand::Liquidate {
        symbol: symbol.to_string(),
        mark_price: Price::new_unchecked(dec!(61000)),
    }) {
        println!(
            "  {} trades, {} transactions, {} failed units",
            output.trades.len(),
            output.transactions.len(),
            output.failed_liquidations.len()
        );
    }
    for account in engine.accounts() {
        println!("  account {} ({:?} {}): balance {}", account.id.0, account.user_id, account.asset, account.balance);
    }
}
