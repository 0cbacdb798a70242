//! Position-channel consumer.
//!
//! Mirrors the two-stage shape of the orders pipeline, with one extra hop:
//! raw payloads land on a data queue, a single worker journals the snapshot
//! and diffs it against the last known size per position id, and detected
//! decreases travel a second bounded queue to the reconciler. Both workers
//! are singletons so per-pid ordering follows `uTime` order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use skein_core::{CloseEvent, DedupKey, PositionId, Quantity};
use skein_ledger::{Journal, ReconciliationEngine};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::dedup::DedupRegistry;
use crate::frames::{FrameKind, PositionMsg, PrivateFrame};
use crate::ws::{SessionConfig, SessionStatus, SessionTransport};

struct PositionJob {
    msg: PositionMsg,
    kind: FrameKind,
}

struct CloseJob {
    event: CloseEvent,
    key: DedupKey,
}

/// Health snapshot for the embedding process.
#[derive(Clone, Copy, Debug)]
pub struct PositionStreamStatus {
    pub session: SessionStatus,
    pub tracked_positions: usize,
    pub dropped_events: u64,
}

/// Streaming client for the private positions channel.
pub struct PositionStream {
    transport: Arc<SessionTransport>,
    data_sender: mpsc::Sender<Option<PositionJob>>,
    close_sender: mpsc::Sender<Option<CloseJob>>,
    last_by_pid: Arc<DashMap<PositionId, (Quantity, i64)>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl PositionStream {
    /// Wire up the stream; `start` must be called to begin consuming.
    pub fn new(
        mut config: SessionConfig,
        dedup: Arc<DedupRegistry>,
        journal: Arc<Journal>,
        engine: Arc<ReconciliationEngine>,
        data_queue_depth: usize,
        close_queue_depth: usize,
    ) -> Self {
        config.channels = vec![crate::ws::PrivateChannel::Positions];
        let transport = Arc::new(SessionTransport::new(config));
        let (data_sender, mut data_receiver) =
            mpsc::channel::<Option<PositionJob>>(data_queue_depth.max(1));
        let (close_sender, mut close_receiver) =
            mpsc::channel::<Option<CloseJob>>(close_queue_depth.max(1));
        let last_by_pid: Arc<DashMap<PositionId, (Quantity, i64)>> = Arc::new(DashMap::new());
        let dropped = Arc::new(AtomicU64::new(0));

        let intake_tx = data_sender.clone();
        let intake_dropped = dropped.clone();
        transport.on_frame(move |frame| {
            if let PrivateFrame::Positions { kind, data } = frame {
                for msg in data {
                    if intake_tx.try_send(Some(PositionJob { msg, kind })).is_err() {
                        intake_dropped.fetch_add(1, Ordering::Relaxed);
                        error!("position data queue full, dropping newest payload");
                    }
                }
            }
        });

        let mut workers = Vec::new();

        // Data worker: journal the snapshot, diff, detect closes.
        {
            let dedup = dedup.clone();
            let journal = journal.clone();
            let close_tx = close_sender.clone();
            let last_by_pid = last_by_pid.clone();
            let dropped = dropped.clone();
            workers.push(tokio::spawn(async move {
                while let Some(Some(job)) = data_receiver.recv().await {
                    handle_position(&dedup, &journal, &close_tx, &last_by_pid, &dropped, job);
                }
                debug!("position data worker exited");
            }));
        }

        // Close worker: feed detected decreases to the reconciler.
        {
            let dedup = dedup.clone();
            workers.push(tokio::spawn(async move {
                while let Some(Some(job)) = close_receiver.recv().await {
                    if let Err(err) = engine.on_position_change(job.event).await {
                        warn!(key = %job.key, error = %err, "close reconciliation failed");
                    }
                    dedup.mark_processed(&job.key);
                }
                debug!("close worker exited");
            }));
        }

        Self {
            transport,
            data_sender,
            close_sender,
            last_by_pid,
            workers: parking_lot::Mutex::new(workers),
            dropped,
        }
    }

    pub fn start(&self) {
        self.transport.start();
    }

    /// Stop the session and drain both workers, bounded to 3s each.
    pub async fn stop(&self) {
        self.transport.stop().await;
        let _ = self.data_sender.send(None).await;
        let _ = self.close_sender.send(None).await;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if timeout(Duration::from_secs(3), worker).await.is_err() {
                warn!("position worker did not stop within 3s; aborting");
            }
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.transport.is_ready()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    #[must_use]
    pub fn status(&self) -> PositionStreamStatus {
        PositionStreamStatus {
            session: self.transport.status(),
            tracked_positions: self.last_by_pid.len(),
            dropped_events: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Process one position payload: persist, classify, maybe emit a close.
fn handle_position(
    dedup: &DedupRegistry,
    journal: &Journal,
    close_tx: &mpsc::Sender<Option<CloseJob>>,
    last_by_pid: &DashMap<PositionId, (Quantity, i64)>,
    dropped: &AtomicU64,
    job: PositionJob,
) {
    let msg = job.msg;
    if msg.pos_id.is_empty() {
        warn!("position payload without posId dropped");
        return;
    }
    let Some(u_time) = msg.u_time_ms() else {
        warn!(pid = %msg.pos_id, u_time = %msg.u_time, "position payload with bad uTime dropped");
        return;
    };

    if let Some(snapshot) = msg.snapshot() {
        if let Err(err) = journal.record_position_snapshot(&snapshot) {
            warn!(pid = %msg.pos_id, error = %err, "position snapshot write failed");
        }
    }

    let pos = msg.pos_value();
    let previous = last_by_pid.get(&msg.pos_id).map(|entry| *entry);

    if let Some(event) = classify(&msg, job.kind, pos, previous, u_time) {
        let key = DedupKey::position(msg.pos_id.clone(), u_time);
        if dedup.is_processed(&key) {
            debug!(key = %key, "close event already processed");
        } else if !dedup.try_claim(key.clone()) {
            debug!(key = %key, "close event already queued");
        } else if close_tx.try_send(Some(CloseJob { event, key: key.clone() })).is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
            error!(key = %key, "close queue full, dropping newest event");
        }
    }

    // State is updated after the enqueue decision so the diff above stayed
    // stable for this payload.
    last_by_pid.insert(msg.pos_id.clone(), (pos, u_time));
}

/// Decide whether this observation is a full close, a partial close, or a
/// state-only update.
fn classify(
    msg: &PositionMsg,
    kind: FrameKind,
    pos: Quantity,
    previous: Option<(Quantity, i64)>,
    u_time: i64,
) -> Option<CloseEvent> {
    let pos_side = msg.pos_side_value()?;
    let prev_pos = previous.map(|(p, _)| p);

    let full_close = pos.is_zero()
        && match kind {
            FrameKind::EventUpdate => prev_pos.map_or(true, |prev| prev > Decimal::ZERO),
            // A snapshot that reports a flat position is only conservative
            // evidence of a close when no previous state exists: a close may
            // have happened during the reconnect gap.
            FrameKind::Snapshot => prev_pos.is_none(),
        };
    let partial_close =
        prev_pos.is_some_and(|prev| pos > Decimal::ZERO && pos < prev);

    if !full_close && !partial_close {
        return None;
    }

    Some(CloseEvent {
        pid: msg.pos_id.clone(),
        symbol: msg.inst_id.clone(),
        pos_side,
        close_amount: (prev_pos.unwrap_or(pos) - pos).max(Decimal::ZERO),
        is_full_close: full_close,
        u_time,
        mark_px: if msg.mark_px.is_empty() {
            None
        } else {
            msg.mark_px.parse().ok()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn msg(pid: &str, pos: &str, u_time: &str) -> PositionMsg {
        PositionMsg {
            pos_id: pid.into(),
            inst_id: "ETH-USDT-SWAP".into(),
            pos_side: "long".into(),
            pos: pos.into(),
            avail_pos: pos.into(),
            avg_px: "3000".into(),
            u_time: u_time.into(),
            mark_px: "3100".into(),
            lever: "3".into(),
            mgn_mode: "cross".into(),
        }
    }

    #[test]
    fn full_close_detected_against_previous_size() {
        let m = msg("P", "0", "1700000000001");
        let event = classify(
            &m,
            FrameKind::EventUpdate,
            Decimal::ZERO,
            Some((dec!(1), 1_700_000_000_000)),
            1_700_000_000_001,
        )
        .unwrap();
        assert!(event.is_full_close);
        assert_eq!(event.close_amount, dec!(1));
        assert_eq!(event.mark_px, Some(dec!(3100)));
    }

    #[test]
    fn partial_close_detected() {
        let m = msg("P", "0.5", "1700000000002");
        let event = classify(
            &m,
            FrameKind::EventUpdate,
            dec!(0.5),
            Some((dec!(2), 1_700_000_000_000)),
            1_700_000_000_002,
        )
        .unwrap();
        assert!(!event.is_full_close);
        assert_eq!(event.close_amount, dec!(1.5));
    }

    #[test]
    fn unchanged_or_increased_positions_emit_nothing() {
        let m = msg("P", "2", "1700000000003");
        assert!(classify(
            &m,
            FrameKind::EventUpdate,
            dec!(2),
            Some((dec!(2), 1_700_000_000_000)),
            1_700_000_000_003,
        )
        .is_none());
        assert!(classify(
            &m,
            FrameKind::EventUpdate,
            dec!(3),
            Some((dec!(2), 1_700_000_000_000)),
            1_700_000_000_003,
        )
        .is_none());
    }

    #[test]
    fn snapshot_zero_without_prior_state_emits_conservatively() {
        let m = msg("P", "0", "1700000000004");
        let event = classify(
            &m,
            FrameKind::Snapshot,
            Decimal::ZERO,
            None,
            1_700_000_000_004,
        )
        .unwrap();
        assert!(event.is_full_close);
        // Unknown previous size: the ledger resolves the amount.
        assert_eq!(event.close_amount, Decimal::ZERO);
    }

    #[test]
    fn snapshot_zero_with_known_state_defers_to_event_updates() {
        let m = msg("P", "0", "1700000000005");
        assert!(classify(
            &m,
            FrameKind::Snapshot,
            Decimal::ZERO,
            Some((dec!(1), 1_700_000_000_000)),
            1_700_000_000_005,
        )
        .is_none());
    }

    #[test]
    fn event_update_zero_without_prior_state_emits() {
        let m = msg("P", "0", "1700000000006");
        let event = classify(
            &m,
            FrameKind::EventUpdate,
            Decimal::ZERO,
            None,
            1_700_000_000_006,
        )
        .unwrap();
        assert!(event.is_full_close);
        assert_eq!(event.close_amount, Decimal::ZERO);
    }
}
