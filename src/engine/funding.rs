//! Funding rate settlement.

use super::commands::FundingRequest;
use super::core::Engine;
use super::results::EngineError;
use crate::funding::{qty_at_time, FundingSummary};
use crate::history::{FundingHistory, Transaction, TransactionKind};
use crate::margin::MarginCalculator;
use crate::types::HistoryId;
use tracing::{debug, info};

impl Engine {
    /// Charge or pay every position of a symbol for one funding interval.
    /// Sizes come from position history at the funding time, so fills that
    /// landed after it do not change what a position owes.
    pub(super) fn pay_funding(&mut self, request: FundingRequest) -> Result<(), EngineError> {
        let instrument = self.instrument(&request.symbol)?.clone();
        self.set_mark_price(&request.symbol, request.mark_price);
        if let Some(extra) = self.extras.get_mut(&request.symbol) {
            extra.funding_rate = request.rate;
        }

        let mut summary = FundingSummary {
            symbol: request.symbol.clone(),
            rate: request.rate,
            mark_price: Some(request.mark_price),
            ..FundingSummary::default()
        };
        for position in self.ledger.positions_of_symbol(&request.symbol) {
            let history = self.ledger.position_history_of(position.id);
            let qty = qty_at_time(&history, request.funding_time, position.current_qty);
            if qty.is_zero() {
                continue;
            }
            let fee = MarginCalculator::new(&instrument, request.mark_price).funding_fee(qty, request.rate);
            if fee.is_zero() {
                continue;
            }

            self.apply_balance_change(position.account_id, fee)?;
            self.ledger.insert_transaction(
                Transaction::new(position.account_id, &position.asset, fee, TransactionKind::Funding),
                self.now,
            )?;
            self.ledger.insert_funding_history(
                FundingHistory {
                    id: HistoryId(0),
                    position_id: position.id,
                    account_id: position.account_id,
                    symbol: position.symbol.clone(),
                    qty,
                    rate: request.rate,
                    mark_price: request.mark_price,
                    fee,
                    funding_time: request.funding_time,
                    created_at: self.now,
                },
                self.now,
            )?;
            summary.record(fee);
            debug!(position = %position.key(), %qty, %fee, "funding settled");
        }

        info!(
            symbol = %summary.symbol,
            rate = %summary.rate,
            positions = summary.positions_charged,
            paid = %summary.total_paid,
            received = %summary.total_received,
            "funding round settled"
        );
        Ok(())
    }
}
