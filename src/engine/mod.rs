// 8.0: core exchange engine. applies one command at a time against the staged
// ledger: orders, matching, wallet moves, funding and liquidation.
// deterministic and command-driven with no external I/O.

mod accounts;
mod commands;
mod config;
mod core;
mod funding;
mod liquidations;
mod matching;
mod orders;
mod positions;
mod results;

pub use commands::{
    CommandEnvelope, EngineCommand, FundingRequest, LeverageRequest, MarginRequest, OrderRequest, WalletRequest,
};
pub use config::{ConfigError, EngineConfig, Environment};
pub use core::Engine;
pub use results::EngineError;
