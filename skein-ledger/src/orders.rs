//! In-memory order store with monotonic state transitions, backed by the
//! journal's `orders` table.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use skein_core::{OrderId, OrderRecord, OrderState, Quantity};

use crate::{Journal, LedgerResult};

/// Result of applying a streamed order update.
#[derive(Clone, Debug)]
pub struct UpsertOutcome {
    /// False when the update was stale (would have rewound a state).
    pub applied: bool,
    /// Newly filled quantity this update contributed, derived from the
    /// cumulative fill size reported by the venue.
    pub fill_delta: Quantity,
}

/// Keeps the latest known record per exchange order id.
///
/// Updates for a given `oid` must never move the state backwards: once an
/// order is filled, canceled or failed, earlier states arriving late (or
/// replayed) are dropped.
pub struct OrderStore {
    records: DashMap<OrderId, OrderRecord>,
    journal: Arc<Journal>,
}

impl OrderStore {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            records: DashMap::new(),
            journal,
        }
    }

    /// Merge a streamed update into the store.
    ///
    /// Every accepted update lands in the in-memory map, but only fill
    /// states are persisted to the journal's `orders` table; `live` and
    /// cancellation updates are transient. The journal write happens before
    /// the in-memory insert so a failed write leaves the store unchanged
    /// and the caller free to retry.
    pub fn upsert(&self, incoming: OrderRecord) -> LedgerResult<UpsertOutcome> {
        let merged = match self.records.get(&incoming.oid) {
            Some(current) => {
                if !current.state.accepts(incoming.state) {
                    debug!(
                        oid = %incoming.oid,
                        current = current.state.as_str(),
                        incoming = incoming.state.as_str(),
                        "dropping stale order update"
                    );
                    return Ok(UpsertOutcome {
                        applied: false,
                        fill_delta: Decimal::ZERO,
                    });
                }
                let mut merged = incoming;
                // Keep the first-seen creation time and any known cloid.
                merged.created_at = current.created_at;
                if merged.cloid.is_none() {
                    merged.cloid = current.cloid.clone();
                }
                if merged.fill_sz < current.fill_sz {
                    merged.fill_sz = current.fill_sz;
                }
                merged
            }
            None => incoming,
        };

        let fill_delta = merged.fill_sz
            - self
                .records
                .get(&merged.oid)
                .map(|r| r.fill_sz)
                .unwrap_or(Decimal::ZERO);
        if matches!(
            merged.state,
            OrderState::Filled | OrderState::PartiallyFilled
        ) {
            self.journal.upsert_order(&merged)?;
        }
        self.records.insert(merged.oid.clone(), merged);
        Ok(UpsertOutcome {
            applied: true,
            fill_delta: fill_delta.max(Decimal::ZERO),
        })
    }

    #[must_use]
    pub fn get(&self, oid: &str) -> Option<OrderRecord> {
        self.records.get(oid).map(|r| r.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
