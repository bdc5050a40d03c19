// exchange-core: matching and risk core of a leveraged futures exchange.
// risk-first architecture: margin math and liquidation take priority.
// all computation is deterministic with no external I/O.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Side, Price, Leverage, Timestamp
//   2.x  store.rs: staged entity store, checkpoints, ttl reaper, id pool
//   2.5  ledger.rs: every store plus its indexes under one transaction
//   3.x  rules.rs: trading rules, leverage/maintenance tiers
//   3.1  margin.rs: linear and inverse margin math
//   3.2  instrument.rs: contract specs and market data
//   4.x  position.rs: position struct, fills, reservations
//   5.x  order.rs: orders and the journaled order book
//   5.1  conditional.rs: stops, take-profit, stop-loss, reduce-only
//   6.x  funding.rs: funding quantity lookup
//   6.1  liquidation.rs: liquidation predicate and clearance fee
//   6.2  ranking.rs: pnl ranking index for auto-deleveraging
//   7.x  context.rs: insurance and bot user tables
//   8.x  engine/: command stream, orders, matching, funding, liquidations
//   9.x  account.rs: wallet per (user, asset)
//   10.x history.rs: trades, transactions, margin/position/funding history
//   11.x events.rs: per-command output

pub mod account;
pub mod conditional;
pub mod context;
pub mod engine;
pub mod events;
pub mod funding;
pub mod history;
pub mod instrument;
pub mod ledger;
pub mod liquidation;
pub mod margin;
pub mod order;
pub mod position;
pub mod ranking;
pub mod rules;
pub mod store;
pub mod types;

// re exports for convenience
pub use account::Account;
pub use context::EngineContext;
pub use engine::*;
pub use events::{CommandOutput, FailedLiquidation};
pub use history::{FundingHistory, MarginChange, MarginHistory, PositionHistory, Trade, Transaction, TransactionKind};
pub use instrument::{Instrument, InstrumentError, InstrumentExtra};
pub use ledger::{IdSeeds, Ledger};
pub use liquidation::{LiquidationProgress, LiquidationStage};
pub use margin::MarginCalculator;
pub use order::{BookDelta, Order, OrderBook, OrderNote, OrderStatus, OrderType, TimeInForce, TpSl};
pub use position::Position;
pub use ranking::PnlRankingIndex;
pub use rules::{LeverageMarginRule, RuleIndex, TradingRule};
pub use store::{EntityStore, StoreError};
pub use types::*;
