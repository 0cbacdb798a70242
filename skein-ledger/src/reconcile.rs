//! Correlates streamed order fills and position decreases with the trade
//! ledger and drives the resulting lifecycle transitions.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use skein_broker::ExchangeClient;
use skein_core::{
    ActionKind, ClientOrderId, CloseEvent, OrderId, PosSide, Price, Quantity, Side, Symbol,
};

use crate::{CloseOutcome, LedgerResult, TradeLedger};

/// A fill delta handed over by the order stream worker.
#[derive(Clone, Debug)]
pub struct OrderFill {
    pub oid: OrderId,
    pub cloid: Option<ClientOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub pos_side: PosSide,
    /// Newly filled quantity (not the cumulative total).
    pub fill_delta: Quantity,
    pub fill_px: Option<Price>,
}

/// Entry points invoked from the stream worker tasks.
///
/// The engine owns the stream-originated transitions of trade state; the
/// intent layer owns the locally-originated ones. Both serialize through the
/// ledger's per-trade lock, so their interleavings stay consistent.
pub struct ReconciliationEngine {
    ledger: Arc<TradeLedger>,
    exchange: Arc<dyn ExchangeClient>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<TradeLedger>, exchange: Arc<dyn ExchangeClient>) -> Self {
        Self { ledger, exchange }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<TradeLedger> {
        &self.ledger
    }

    /// Account an order fill against its trade.
    pub async fn on_order_fill(&self, fill: OrderFill) -> LedgerResult<()> {
        if fill.fill_delta <= Decimal::ZERO {
            return Ok(());
        }

        let (cloid, kind) = match self.correlate_fill(&fill) {
            Some(resolved) => resolved,
            None => {
                if let Some(cloid) = &fill.cloid {
                    // A fill for a trade this ledger never opened: keep it
                    // auditable instead of failing the worker.
                    warn!(oid = %fill.oid, %cloid, "fill for unknown trade journaled as orphan");
                    self.journal_orphan_fill(&fill).await?;
                } else {
                    debug!(oid = %fill.oid, "fill without client order id ignored");
                }
                return Ok(());
            }
        };

        let outcome = self
            .ledger
            .apply_fill(&cloid, &fill.oid, kind, fill.fill_delta, fill.fill_px)
            .await?;
        if outcome.closed {
            info!(%cloid, oid = %fill.oid, "trade closed by order fill");
            self.cancel_paired_algos(&fill.symbol, &outcome.cancel).await;
        }
        Ok(())
    }

    /// Apply an externally observed position decrease.
    pub async fn on_position_change(&self, event: CloseEvent) -> LedgerResult<()> {
        let cloid = self
            .ledger
            .resolve_pid(&event.pid)
            .or_else(|| self.ledger.resolve_exposure(&event.symbol, event.pos_side));
        if let Some(cloid) = &cloid {
            // First correlated event for this pid establishes the binding.
            self.ledger.bind_pid(cloid, &event.pid);
        }

        match self
            .ledger
            .apply_external_close(cloid.as_deref(), &event)
            .await?
        {
            CloseOutcome::Applied {
                kind,
                amount,
                closed,
                cancel,
            } => {
                info!(
                    cloid = cloid.as_deref().unwrap_or("-"),
                    pid = %event.pid,
                    kind = kind.as_str(),
                    %amount,
                    closed,
                    "position decrease reconciled"
                );
                if closed {
                    self.cancel_paired_algos(&event.symbol, &cancel).await;
                }
            }
            CloseOutcome::Orphaned => {
                warn!(
                    pid = %event.pid,
                    symbol = %event.symbol,
                    "position decrease with no owning trade journaled as orphan"
                );
            }
            CloseOutcome::AlreadyClosed | CloseOutcome::Duplicate => {
                debug!(pid = %event.pid, u_time = event.u_time, "position decrease already accounted");
            }
        }
        Ok(())
    }

    /// Resolve which trade a fill belongs to and what it does to it.
    fn correlate_fill(&self, fill: &OrderFill) -> Option<(ClientOrderId, ActionKind)> {
        if let Some((cloid, kind)) = self.ledger.submit_kind(&fill.oid) {
            return Some((cloid, kind));
        }
        let cloid = fill.cloid.as_deref()?;
        if self.ledger.contains(cloid) {
            let kind = if fill.side == fill.pos_side.entry_side() {
                ActionKind::Add
            } else {
                ActionKind::Reduce
            };
            return Some((cloid.to_string(), kind));
        }
        // Conditional exit orders carry their own cloid; a fill there closes
        // the parent trade.
        self.ledger
            .parent_of_exit(cloid)
            .map(|parent| (parent, ActionKind::Close))
    }

    async fn journal_orphan_fill(&self, fill: &OrderFill) -> LedgerResult<()> {
        let event = CloseEvent {
            pid: String::new(),
            symbol: fill.symbol.clone(),
            pos_side: fill.pos_side,
            close_amount: fill.fill_delta,
            is_full_close: false,
            u_time: 0,
            mark_px: fill.fill_px,
        };
        self.ledger.apply_external_close(None, &event).await?;
        Ok(())
    }

    /// Best-effort cancellation of the paired stop/tp orders; failures are
    /// logged and never fail the close transition.
    async fn cancel_paired_algos(&self, symbol: &str, algo_cloids: &[ClientOrderId]) {
        for algo in algo_cloids {
            if let Err(err) = self.exchange.cancel_algo(symbol, algo).await {
                warn!(%algo, error = %err, "failed to cancel conditional order");
            }
        }
    }
}
