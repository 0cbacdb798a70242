//! The ledger of logical trades keyed by client order id.
//!
//! Every mutation of a trade serializes through that trade's own async
//! mutex, so the stream-driven reconciler and the intent layer never
//! interleave partial updates. Journal rows are written while the lock is
//! held; in-memory state is the source of truth for readers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use skein_core::{
    new_client_order_id, ActionKind, ClientOrderId, CloseEvent, CloseIntent, IntentKind, OrderId,
    PosSide, Price, Quantity, Symbol, Trade, TradeAction, TradeState,
};

use crate::{Journal, LedgerError, LedgerResult};

const DEFAULT_INTENT_TTL: Duration = Duration::from_secs(60);

/// Parameters for opening a new logical trade.
#[derive(Clone, Debug)]
pub struct OpenParams {
    pub symbol: Symbol,
    pub pos_side: PosSide,
    pub size: Quantity,
    pub leverage: u32,
    pub signal_id: Option<i64>,
    /// Client ids minted for the paired conditional orders, when the caller
    /// intends to place them.
    pub stop_loss_cloid: Option<ClientOrderId>,
    pub take_profit_cloid: Option<ClientOrderId>,
}

/// Result of applying an order fill to a trade.
#[derive(Clone, Debug, Default)]
pub struct FillOutcome {
    /// True when the fill took the trade to its terminal state.
    pub closed: bool,
    /// Conditional order ids to cancel now that the trade is closed.
    pub cancel: Vec<ClientOrderId>,
    /// False when the fill was dropped (trade already closed).
    pub applied: bool,
}

/// Result of applying an externally observed position decrease.
#[derive(Clone, Debug)]
pub enum CloseOutcome {
    /// No trade could be correlated; an orphan journal row was written.
    Orphaned,
    /// The trade had already reached its terminal state; nothing written.
    AlreadyClosed,
    /// The same position update was applied before; nothing written.
    Duplicate,
    /// The decrease was applied.
    Applied {
        kind: ActionKind,
        amount: Quantity,
        closed: bool,
        /// Conditional order ids to cancel, populated on full close.
        cancel: Vec<ClientOrderId>,
    },
}

struct SubmitRecord {
    cloid: ClientOrderId,
    kind: ActionKind,
}

/// In-memory + persisted record of logical trades.
pub struct TradeLedger {
    journal: Arc<Journal>,
    trades: DashMap<ClientOrderId, Arc<Mutex<Trade>>>,
    /// Exchange position id -> owning trade. Never silently rebound.
    pid_index: DashMap<String, ClientOrderId>,
    /// Active trade per `(symbol, posSide)`, used to resolve position events
    /// that arrive before the pid binding exists.
    exposure_index: DashMap<(Symbol, PosSide), ClientOrderId>,
    /// Submitted order id -> trade + intended action, recorded pre-fill.
    submits: DashMap<OrderId, SubmitRecord>,
    /// Conditional order cloid -> parent trade cloid.
    exit_orders: DashMap<ClientOrderId, ClientOrderId>,
    intent_ttl: Duration,
}

impl TradeLedger {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self::with_intent_ttl(journal, DEFAULT_INTENT_TTL)
    }

    pub fn with_intent_ttl(journal: Arc<Journal>, intent_ttl: Duration) -> Self {
        Self {
            journal,
            trades: DashMap::new(),
            pid_index: DashMap::new(),
            exposure_index: DashMap::new(),
            submits: DashMap::new(),
            exit_orders: DashMap::new(),
            intent_ttl,
        }
    }

    /// Rebuild the in-memory maps from journaled non-terminal trades after a
    /// restart. Pid bindings are re-learned from the next position snapshot.
    pub fn restore(&self) -> LedgerResult<usize> {
        let open = self.journal.load_open_trades()?;
        let count = open.len();
        for trade in open {
            self.index_trade(&trade);
            self.trades
                .insert(trade.cloid.clone(), Arc::new(Mutex::new(trade)));
        }
        Ok(count)
    }

    fn index_trade(&self, trade: &Trade) {
        self.exposure_index.insert(
            (trade.symbol.clone(), trade.pos_side),
            trade.cloid.clone(),
        );
        if let Some(sl) = &trade.stop_loss_cloid {
            self.exit_orders.insert(sl.clone(), trade.cloid.clone());
        }
        if let Some(tp) = &trade.take_profit_cloid {
            self.exit_orders.insert(tp.clone(), trade.cloid.clone());
        }
    }

    /// Create a trade record ahead of order submission and return the client
    /// order id the caller must attach to every message of this trade.
    pub fn open(&self, params: OpenParams) -> LedgerResult<ClientOrderId> {
        let cloid = new_client_order_id(&params.symbol, params.pos_side);
        let trade = Trade {
            cloid: cloid.clone(),
            symbol: params.symbol,
            pos_side: params.pos_side,
            signal_id: params.signal_id,
            current_size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            leverage: params.leverage,
            stop_loss_cloid: params.stop_loss_cloid,
            take_profit_cloid: params.take_profit_cloid,
            state: TradeState::Open,
            opened_at: Utc::now(),
            closed_at: None,
            intent: None,
            last_external_utime: None,
        };
        self.journal.upsert_trade(&trade)?;
        self.index_trade(&trade);
        self.trades.insert(cloid.clone(), Arc::new(Mutex::new(trade)));
        Ok(cloid)
    }

    /// Associate the conditional orders placed for a trade after the fact.
    pub async fn bind_algo_orders(
        &self,
        cloid: &str,
        stop_loss: Option<ClientOrderId>,
        take_profit: Option<ClientOrderId>,
    ) -> LedgerResult<()> {
        let handle = self.handle(cloid)?;
        let mut trade = handle.lock().await;
        if let Some(sl) = stop_loss {
            self.exit_orders.insert(sl.clone(), trade.cloid.clone());
            trade.stop_loss_cloid = Some(sl);
        }
        if let Some(tp) = take_profit {
            self.exit_orders.insert(tp.clone(), trade.cloid.clone());
            trade.take_profit_cloid = Some(tp);
        }
        self.journal.upsert_trade(&trade)
    }

    /// Record a submitted order: associates the venue order id with the
    /// trade and writes the journal row whose amount stays pending until the
    /// fill arrives.
    pub async fn record_submit(
        &self,
        cloid: &str,
        oid: &str,
        kind: ActionKind,
    ) -> LedgerResult<()> {
        let handle = self.handle(cloid)?;
        let trade = handle.lock().await;
        self.submits.insert(
            oid.to_string(),
            SubmitRecord {
                cloid: cloid.to_string(),
                kind,
            },
        );
        if trade.state == TradeState::Closed {
            // The trade terminated between intent and submission; there is
            // nothing left for this order to account against.
            debug!(%cloid, %oid, "submit recorded against closed trade");
            return Ok(());
        }
        self.journal.append_action(&TradeAction {
            cloid: Some(trade.cloid.clone()),
            signal_id: trade.signal_id,
            symbol: trade.symbol.clone(),
            pos_side: trade.pos_side,
            kind,
            oid: Some(oid.to_string()),
            amount: None,
            ts: Utc::now(),
        })?;
        Ok(())
    }

    /// Flag a locally initiated reduce/close before its order is sent, so
    /// the stream-side detection classifies the resulting position decrease
    /// as local rather than external. Expires after the intent TTL.
    pub async fn mark_intent(&self, cloid: &str, kind: IntentKind) -> LedgerResult<()> {
        let handle = self.handle(cloid)?;
        let mut trade = handle.lock().await;
        if trade.state == TradeState::Closed {
            return Ok(());
        }
        trade.intent = Some(CloseIntent {
            kind,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.intent_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        });
        if kind == IntentKind::Close {
            trade.state = TradeState::Closing;
        }
        self.journal.upsert_trade(&trade)
    }

    /// Store the position id -> trade binding. Idempotent; an existing
    /// binding is never overwritten.
    pub fn bind_pid(&self, cloid: &str, pid: &str) {
        match self.pid_index.entry(pid.to_string()) {
            Entry::Occupied(existing) => {
                if existing.get() != cloid {
                    warn!(
                        %pid,
                        bound = %existing.get(),
                        rejected = %cloid,
                        "refusing to rebind position id"
                    );
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(cloid.to_string());
            }
        }
    }

    /// Apply a fill delta from the order stream.
    pub async fn apply_fill(
        &self,
        cloid: &str,
        oid: &str,
        kind: ActionKind,
        fill_delta: Quantity,
        fill_px: Option<Price>,
    ) -> LedgerResult<FillOutcome> {
        if fill_delta <= Decimal::ZERO {
            return Ok(FillOutcome::default());
        }
        let handle = self.handle(cloid)?;
        let mut trade = handle.lock().await;
        if trade.state == TradeState::Closed {
            // The close already landed via the position stream; this is the
            // late order confirmation of the same exit.
            debug!(%cloid, %oid, "fill for already-closed trade ignored");
            return Ok(FillOutcome::default());
        }

        let now = Utc::now();
        if !self
            .journal
            .complete_pending_action(cloid, kind, fill_delta, now)?
        {
            self.journal.append_action(&TradeAction {
                cloid: Some(trade.cloid.clone()),
                signal_id: trade.signal_id,
                symbol: trade.symbol.clone(),
                pos_side: trade.pos_side,
                kind,
                oid: Some(oid.to_string()),
                amount: Some(fill_delta),
                ts: now,
            })?;
        }

        let mut outcome = FillOutcome {
            applied: true,
            ..FillOutcome::default()
        };
        match kind {
            ActionKind::Open | ActionKind::Add => {
                let total = trade.current_size + fill_delta;
                if let Some(px) = fill_px {
                    trade.entry_price = if trade.current_size.is_zero() {
                        px
                    } else {
                        (trade.entry_price * trade.current_size + px * fill_delta) / total
                    };
                }
                trade.current_size = total;
            }
            ActionKind::Reduce | ActionKind::Close | ActionKind::ExternalClose => {
                trade.current_size = (trade.current_size - fill_delta).max(Decimal::ZERO);
                if trade.current_size.is_zero() {
                    Self::terminate(&mut trade, &mut outcome);
                    self.exposure_index
                        .remove(&(trade.symbol.clone(), trade.pos_side));
                }
            }
        }
        self.journal.upsert_trade(&trade)?;
        Ok(outcome)
    }

    /// Apply an externally observed position decrease. See the close
    /// outcome variants for the possible resolutions.
    pub async fn apply_external_close(
        &self,
        cloid: Option<&str>,
        event: &CloseEvent,
    ) -> LedgerResult<CloseOutcome> {
        let Some(cloid) = cloid else {
            self.journal.append_action(&TradeAction {
                cloid: None,
                signal_id: None,
                symbol: event.symbol.clone(),
                pos_side: event.pos_side,
                kind: ActionKind::ExternalClose,
                oid: None,
                amount: Some(event.close_amount),
                ts: Utc::now(),
            })?;
            return Ok(CloseOutcome::Orphaned);
        };

        let handle = self.handle(cloid)?;
        let mut trade = handle.lock().await;
        if trade.state == TradeState::Closed {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        if trade
            .last_external_utime
            .is_some_and(|seen| event.u_time <= seen)
        {
            return Ok(CloseOutcome::Duplicate);
        }

        let now = Utc::now();
        // Zero close amount means the previous position size was unknown
        // (post-reconnect snapshot); fall back to what the ledger holds.
        let amount = if event.close_amount > Decimal::ZERO {
            event.close_amount
        } else {
            trade.current_size
        };
        let kind = match trade.active_intent(now) {
            Some(IntentKind::Close) => ActionKind::Close,
            Some(IntentKind::Reduce) => ActionKind::Reduce,
            None => ActionKind::ExternalClose,
        };

        if kind == ActionKind::ExternalClose
            || !self
                .journal
                .complete_pending_action(cloid, kind, amount, now)?
        {
            self.journal.append_action(&TradeAction {
                cloid: Some(trade.cloid.clone()),
                signal_id: trade.signal_id,
                symbol: trade.symbol.clone(),
                pos_side: trade.pos_side,
                kind,
                oid: None,
                amount: Some(amount),
                ts: now,
            })?;
        }

        trade.current_size = (trade.current_size - amount).max(Decimal::ZERO);
        trade.last_external_utime = Some(event.u_time);
        trade.intent = None;

        let mut outcome = FillOutcome::default();
        let closed = event.is_full_close || trade.current_size.is_zero();
        if closed {
            Self::terminate(&mut trade, &mut outcome);
            self.exposure_index
                .remove(&(trade.symbol.clone(), trade.pos_side));
        }
        self.journal.upsert_trade(&trade)?;
        Ok(CloseOutcome::Applied {
            kind,
            amount,
            closed,
            cancel: outcome.cancel,
        })
    }

    fn terminate(trade: &mut Trade, outcome: &mut FillOutcome) {
        trade.state = TradeState::Closed;
        trade.closed_at = Some(Utc::now());
        trade.current_size = Decimal::ZERO;
        trade.intent = None;
        outcome.closed = true;
        outcome.cancel = trade
            .stop_loss_cloid
            .iter()
            .chain(trade.take_profit_cloid.iter())
            .cloned()
            .collect();
    }

    /// Snapshot of a trade's current state.
    pub async fn get(&self, cloid: &str) -> Option<Trade> {
        let handle = self.trades.get(cloid)?.clone();
        let trade = handle.lock().await;
        Some(trade.clone())
    }

    /// Resolve the trade bound to a position id.
    #[must_use]
    pub fn resolve_pid(&self, pid: &str) -> Option<ClientOrderId> {
        self.pid_index.get(pid).map(|c| c.clone())
    }

    /// Resolve the active trade for a symbol/direction pair.
    #[must_use]
    pub fn resolve_exposure(&self, symbol: &str, pos_side: PosSide) -> Option<ClientOrderId> {
        self.exposure_index
            .get(&(symbol.to_string(), pos_side))
            .map(|c| c.clone())
    }

    /// The action kind recorded for a submitted order id, if any.
    #[must_use]
    pub fn submit_kind(&self, oid: &str) -> Option<(ClientOrderId, ActionKind)> {
        self.submits
            .get(oid)
            .map(|record| (record.cloid.clone(), record.kind))
    }

    /// The parent trade of a conditional (stop/tp) order id, if registered.
    #[must_use]
    pub fn parent_of_exit(&self, algo_cloid: &str) -> Option<ClientOrderId> {
        self.exit_orders.get(algo_cloid).map(|c| c.clone())
    }

    #[must_use]
    pub fn contains(&self, cloid: &str) -> bool {
        self.trades.contains_key(cloid)
    }

    fn handle(&self, cloid: &str) -> LedgerResult<Arc<Mutex<Trade>>> {
        self.trades
            .get(cloid)
            .map(|h| h.clone())
            .ok_or_else(|| LedgerError::UnknownTrade(cloid.to_string()))
    }
}
