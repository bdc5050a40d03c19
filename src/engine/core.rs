// 8.0 engine/core.rs: main engine. owns the ledger, instruments, rules and the
// command output being built.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::account::Account;
use crate::context::EngineContext;
use crate::events::CommandOutput;
use crate::instrument::{Instrument, InstrumentExtra};
use crate::ledger::{IdSeeds, Ledger};
use crate::margin::MarginCalculator;
use crate::order::{Order, OrderBook};
use crate::position::Position;
use crate::ranking::PnlRankingIndex;
use crate::rules::RuleIndex;
use crate::types::{AccountId, OrderId, PositionKey, Price, Timestamp, UserId};
use std::collections::HashMap;
use tracing::{debug, info};

/** 8.1: main engine struct. all state lives here */
#[derive(Debug)]
pub struct Engine {
    pub(super) ctx: EngineContext,
    pub(super) ledger: Ledger,
    pub(super) instruments: HashMap<String, Instrument>,
    /// Market data, replaced out of band and never staged
    pub(super) extras: HashMap<String, InstrumentExtra>,
    pub(super) rules: RuleIndex,
    pub(super) started: bool,
    pub(super) now: Timestamp,
    pub(super) output: CommandOutput,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let ledger = Ledger::new(&config);
        Ok(Self {
            ctx: EngineContext::new(config),
            ledger,
            instruments: HashMap::new(),
            extras: HashMap::new(),
            rules: RuleIndex::new(),
            started: false,
            now: Timestamp::default(),
            output: CommandOutput::default(),
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn time(&self) -> Timestamp {
        self.now
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_initialized(&self) -> bool {
        self.ledger.is_initialized()
    }

    // 8.2: lifecycle

    pub(super) fn initialize(&mut self, seeds: IdSeeds) {
        self.ledger.initialize(seeds);
        info!(?seeds, "id sequences seeded");
    }

    pub(super) fn start(&mut self) -> Result<(), EngineError> {
        if !self.ledger.is_initialized() {
            return Err(EngineError::EngineNotInitialized);
        }
        self.started = true;
        info!(instruments = self.instruments.len(), "engine started");
        Ok(())
    }

    pub(super) fn stop(&mut self) {
        self.started = false;
        info!("engine stopped");
    }

    pub(super) fn refill_reserved_ids(&mut self, ids: Vec<u64>) {
        let taken = self.ledger.refill_reserved(ids);
        info!(taken, remaining = self.ledger.reserved_remaining(), "reserved ids refilled");
    }

    pub(super) fn update_instrument(&mut self, instrument: Instrument) -> Result<(), EngineError> {
        instrument.validate()?;
        self.extras
            .entry(instrument.symbol.clone())
            .or_insert_with(|| InstrumentExtra::new(instrument.symbol.clone()));
        info!(symbol = %instrument.symbol, contract = ?instrument.contract_type, "instrument loaded");
        self.instruments.insert(instrument.symbol.clone(), instrument);
        Ok(())
    }

    pub(super) fn update_instrument_extra(&mut self, mut extra: InstrumentExtra) -> Result<(), EngineError> {
        if !self.instruments.contains_key(&extra.symbol) {
            return Err(EngineError::InstrumentNotFound(extra.symbol));
        }
        extra.updated_at = self.now;
        self.extras.insert(extra.symbol.clone(), extra);
        Ok(())
    }

    // 8.3: lookups

    pub fn instrument(&self, symbol: &str) -> Result<&Instrument, EngineError> {
        self.instruments
            .get(symbol)
            .ok_or_else(|| EngineError::InstrumentNotFound(symbol.to_string()))
    }

    pub fn instrument_extra(&self, symbol: &str) -> Option<&InstrumentExtra> {
        self.extras.get(symbol)
    }

    /// Mark price, falling back to the last traded price.
    pub fn mark_price(&self, symbol: &str) -> Result<Price, EngineError> {
        self.extras
            .get(symbol)
            .and_then(|e| e.mark_price.or(e.last_price))
            .ok_or_else(|| EngineError::NoMarkPrice(symbol.to_string()))
    }

    pub(super) fn set_mark_price(&mut self, symbol: &str, mark: Price) {
        let extra = self
            .extras
            .entry(symbol.to_string())
            .or_insert_with(|| InstrumentExtra::new(symbol));
        extra.mark_price = Some(mark);
        extra.updated_at = self.now;
    }

    /// Calculator at the current mark, or at `fallback` when the symbol has none yet.
    pub(super) fn calculator<'a>(&self, instrument: &'a Instrument, fallback: Price) -> MarginCalculator<'a> {
        let mark = self.mark_price(&instrument.symbol).unwrap_or(fallback);
        MarginCalculator::new(instrument, mark)
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.ledger.account(id)
    }

    pub fn account_for(&self, user_id: UserId, asset: &str) -> Option<Account> {
        self.ledger.account_for(user_id, asset)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.ledger.accounts()
    }

    pub fn position(&self, account_id: AccountId, symbol: &str) -> Option<Position> {
        self.ledger.position(&PositionKey::new(account_id, symbol))
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.ledger.order(id)
    }

    pub fn open_orders(&self, account_id: AccountId) -> Vec<Order> {
        self.ledger.open_orders_of_account(account_id)
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.ledger.book(symbol)
    }

    pub fn ranking(&self) -> &PnlRankingIndex {
        self.ledger.ranking()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // 8.4: transaction boundary

    /// Commit everything staged and fold it into the command output.
    pub(super) fn commit(&mut self) {
        let committed = self.ledger.commit();
        for trade in &committed.trades {
            if let Some(extra) = self.extras.get_mut(&trade.symbol) {
                extra.last_price = Some(trade.price);
            }
        }
        self.output.merge(committed);
    }

    pub(super) fn rollback(&mut self) {
        self.ledger.rollback();
    }

    pub(super) fn take_output(&mut self) -> CommandOutput {
        std::mem::take(&mut self.output)
    }

    pub(super) fn reap_expired(&mut self) {
        let evicted = self.ledger.reap(self.now);
        if evicted > 0 {
            debug!(evicted, "reaped expired rows");
        }
    }
}
