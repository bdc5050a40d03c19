//! Shared harness: a started engine with one fee-free BTCUSDT instrument,
//! the standard tier ladder and a mark of 65000.

#![allow(dead_code)]

use exchange_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const SYMBOL: &str = "BTCUSDT";
pub const INSURANCE: UserId = UserId(1);

pub fn fee_free() -> Instrument {
    Instrument {
        taker_fee_rate: Decimal::ZERO,
        maker_fee_rate: Decimal::ZERO,
        ..Instrument::btc_usdt()
    }
}

pub struct Harness {
    pub engine: Engine,
    clock: i64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(EngineConfig::testnet(), fee_free())
    }

    pub fn with(config: EngineConfig, instrument: Instrument) -> Self {
        let engine = Engine::new(config).expect("valid config");
        let mut harness = Self { engine, clock: 0 };
        let symbol = instrument.symbol.clone();
        harness.ok(EngineCommand::InitializeEngine(IdSeeds::default()));
        harness.ok(EngineCommand::RefillReservedIds {
            ids: (1_000_000..1_000_100).collect(),
        });
        harness.ok(EngineCommand::UpdateInstrument(instrument));
        for rule in RuleIndex::standard_tiers(&symbol) {
            harness.ok(EngineCommand::LoadLeverageMarginRule(rule));
        }
        harness.ok(EngineCommand::StartEngine);
        harness.set_mark(&symbol, dec!(65000));
        harness
    }

    pub fn run(&mut self, command: EngineCommand) -> Result<CommandOutput, EngineError> {
        self.clock += 1;
        self.engine
            .process(CommandEnvelope::new(Timestamp::from_millis(self.clock), command))
    }

    pub fn ok(&mut self, command: EngineCommand) -> CommandOutput {
        self.run(command).expect("command accepted")
    }

    pub fn set_mark(&mut self, symbol: &str, price: Decimal) {
        let mut extra = InstrumentExtra::new(symbol);
        extra.mark_price = Price::new(price);
        self.ok(EngineCommand::UpdateInstrumentExtra(extra));
    }

    pub fn deposit(&mut self, user: UserId, amount: Decimal) {
        self.ok(EngineCommand::Deposit(WalletRequest {
            user_id: user,
            asset: "USDT".to_string(),
            amount,
            hash: None,
        }));
    }

    pub fn place(&mut self, request: OrderRequest) -> Result<CommandOutput, EngineError> {
        self.run(EngineCommand::PlaceOrder(request))
    }

    pub fn limit(&mut self, user: UserId, side: Side, qty: Decimal, price: Decimal) -> Order {
        let output = self
            .place(OrderRequest::limit(user, SYMBOL, side, qty, price))
            .expect("limit order accepted");
        newest(&output)
    }

    pub fn market(&mut self, user: UserId, side: Side, qty: Decimal) -> CommandOutput {
        self.place(OrderRequest::market(user, SYMBOL, side, qty))
            .expect("market order accepted")
    }

    /// Market order that opens (or adds to) an isolated position.
    pub fn market_isolated(&mut self, user: UserId, side: Side, qty: Decimal, leverage: Decimal) -> CommandOutput {
        let mut request = OrderRequest::market(user, SYMBOL, side, qty);
        request.margin_mode = Some(MarginMode::Isolated);
        request.leverage = Some(leverage);
        self.place(request).expect("isolated order accepted")
    }

    pub fn liquidate(&mut self, mark: Decimal) -> CommandOutput {
        self.ok(EngineCommand::Liquidate {
            symbol: SYMBOL.to_string(),
            mark_price: Price::new_unchecked(mark),
        })
    }

    pub fn account(&self, user: UserId) -> Account {
        self.engine.account_for(user, "USDT").expect("account exists")
    }

    pub fn position(&self, user: UserId) -> Position {
        let account = self.account(user);
        self.engine.position(account.id, SYMBOL).expect("position exists")
    }

    pub fn available(&self, user: UserId) -> Decimal {
        let account = self.account(user);
        self.engine.available_balance(account.id).expect("account exists")
    }
}

/// Order with the highest sequence id in a command's output.
pub fn newest(output: &CommandOutput) -> Order {
    output
        .orders
        .iter()
        .filter(|o| o.id.0 < 1_000_000)
        .max_by_key(|o| o.id)
        .cloned()
        .expect("command touched an order")
}
