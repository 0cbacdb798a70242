//! Order-channel consumer.
//!
//! The session task performs only intake: dedup the `(oid, uTime)` key and
//! push the payload onto a bounded queue. A small worker pool normalizes,
//! persists via the order store and hands fill deltas to the reconciler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use skein_core::{DedupKey, OrderState};
use skein_ledger::{OrderFill, OrderStore, ReconciliationEngine};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

use crate::dedup::DedupRegistry;
use crate::frames::{OrderMsg, PrivateFrame};
use crate::ws::{SessionConfig, SessionStatus, SessionTransport};

const WRITE_RETRY_LIMIT: u32 = 3;
const FAILED_KEY_TTL: Duration = Duration::from_secs(30 * 60);

struct OrderJob {
    msg: OrderMsg,
    key: DedupKey,
}

/// Health snapshot for the embedding process.
#[derive(Clone, Copy, Debug)]
pub struct OrderStreamStatus {
    pub session: SessionStatus,
    pub dropped_events: u64,
}

/// Streaming client for the private orders channel.
pub struct OrderStream {
    transport: Arc<SessionTransport>,
    sender: mpsc::Sender<Option<OrderJob>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl OrderStream {
    /// Wire up the stream; `start` must be called to begin consuming.
    pub fn new(
        mut config: SessionConfig,
        dedup: Arc<DedupRegistry>,
        store: Arc<OrderStore>,
        engine: Arc<ReconciliationEngine>,
        queue_depth: usize,
        worker_count: usize,
    ) -> Self {
        config.channels = vec![crate::ws::PrivateChannel::Orders];
        let transport = Arc::new(SessionTransport::new(config));
        let (sender, receiver) = mpsc::channel::<Option<OrderJob>>(queue_depth.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let intake_dedup = dedup.clone();
        let intake_tx = sender.clone();
        let intake_dropped = dropped.clone();
        transport.on_frame(move |frame| {
            if let PrivateFrame::Orders { data, .. } = frame {
                for msg in data {
                    intake(&intake_dedup, &intake_tx, &intake_dropped, msg);
                }
            }
        });

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let failed: Arc<DashMap<DedupKey, (u32, Instant)>> = Arc::new(DashMap::new());
        let mut workers = Vec::new();
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let dedup = dedup.clone();
            let store = store.clone();
            let engine = engine.clone();
            let failed = failed.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(Some(job)) => {
                            process_order(&dedup, &store, &engine, &failed, job).await;
                        }
                        // Sentinel or closed channel: drain ends.
                        Some(None) | None => break,
                    }
                }
                debug!("order worker exited");
            }));
        }

        Self {
            transport,
            sender,
            workers: parking_lot::Mutex::new(workers),
            dropped,
        }
    }

    pub fn start(&self) {
        self.transport.start();
    }

    /// Stop the session and drain the workers, bounded to 3s each.
    pub async fn stop(&self) {
        self.transport.stop().await;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for _ in 0..workers.len() {
            let _ = self.sender.send(None).await;
        }
        for worker in workers {
            if timeout(Duration::from_secs(3), worker).await.is_err() {
                warn!("order worker did not stop within 3s; aborting");
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
    pub fn status(&self) -> OrderStreamStatus {
        OrderStreamStatus {
            session: self.transport.status(),
            dropped_events: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking intake on the session task: dedup and enqueue.
fn intake(
    dedup: &DedupRegistry,
    sender: &mpsc::Sender<Option<OrderJob>>,
    dropped: &AtomicU64,
    msg: OrderMsg,
) {
    if msg.ord_id.is_empty() {
        warn!("order payload without ordId dropped");
        return;
    }
    // An unparseable update time still dedups, against the arrival clock.
    let u_time = msg
        .u_time_ms()
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let key = DedupKey::order(msg.ord_id.clone(), u_time);
    if dedup.is_processed(&key) {
        debug!(key = %key, "order update already processed");
        return;
    }
    if !dedup.try_claim(key.clone()) {
        debug!(key = %key, "order update already queued");
        return;
    }
    if sender.try_send(Some(OrderJob { msg, key: key.clone() })).is_err() {
        error!(key = %key, "order queue full, dropping newest event");
        dropped.fetch_add(1, Ordering::Relaxed);
        // Marked processed so replays do not hammer a saturated queue; the
        // periodic REST reconciliation recovers the lost update.
        dedup.mark_processed(&key);
    }
}

async fn process_order(
    dedup: &DedupRegistry,
    store: &OrderStore,
    engine: &ReconciliationEngine,
    failed: &DashMap<DedupKey, (u32, Instant)>,
    job: OrderJob,
) {
    let Some(record) = job.msg.normalize(Utc::now()) else {
        warn!(oid = %job.msg.ord_id, state = %job.msg.state, "unrecognized order payload dropped");
        dedup.mark_processed(&job.key);
        return;
    };

    match store.upsert(record.clone()) {
        Ok(outcome) => {
            if outcome.applied
                && matches!(
                    record.state,
                    OrderState::Filled | OrderState::PartiallyFilled
                )
            {
                let fill = OrderFill {
                    oid: record.oid.clone(),
                    cloid: record.cloid.clone(),
                    symbol: record.symbol.clone(),
                    side: record.side,
                    pos_side: record.pos_side,
                    fill_delta: outcome.fill_delta,
                    fill_px: record.fill_px,
                };
                if let Err(err) = engine.on_order_fill(fill).await {
                    warn!(oid = %record.oid, error = %err, "fill handling failed");
                }
            }
            failed.remove(&job.key);
            dedup.mark_processed(&job.key);
        }
        Err(err) => {
            // Bounded retry budget per key: leave the claim in place so a
            // venue replay can retry after the in-flight TTL, and give up
            // for good once the budget is spent.
            sweep_failed(failed);
            let attempts = {
                let mut entry = failed.entry(job.key.clone()).or_insert((0, Instant::now()));
                entry.0 += 1;
                entry.1 = Instant::now();
                entry.0
            };
            if attempts >= WRITE_RETRY_LIMIT {
                error!(
                    key = %job.key,
                    attempts,
                    error = %err,
                    "order write failed; retry budget exhausted"
                );
                failed.remove(&job.key);
                dedup.mark_processed(&job.key);
            } else {
                warn!(key = %job.key, attempts, error = %err, "order write failed");
            }
        }
    }
}

fn sweep_failed(failed: &DashMap<DedupKey, (u32, Instant)>) {
    let now = Instant::now();
    failed.retain(|_, (_, last)| now.duration_since(*last) < FAILED_KEY_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(oid: &str, u_time: &str) -> OrderMsg {
        OrderMsg {
            ord_id: oid.into(),
            cl_ord_id: "c1".into(),
            inst_id: "ETH-USDT-SWAP".into(),
            side: "buy".into(),
            pos_side: "long".into(),
            ord_type: "market".into(),
            px: String::new(),
            sz: "1".into(),
            acc_fill_sz: "1".into(),
            avg_px: "3000".into(),
            state: "filled".into(),
            lever: "3".into(),
            td_mode: "cross".into(),
            tag: String::new(),
            c_time: "1700000000000".into(),
            u_time: u_time.into(),
            fill_time: String::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_updates_are_not_enqueued_twice() {
        let dedup = DedupRegistry::for_orders();
        let (tx, mut rx) = mpsc::channel(16);
        let dropped = AtomicU64::new(0);

        intake(&dedup, &tx, &dropped, msg("O1", "1700000000001"));
        intake(&dedup, &tx, &dropped, msg("O1", "1700000000001"));
        intake(&dedup, &tx, &dropped, msg("O1", "1700000000002"));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn saturated_queue_drops_the_newest_event() {
        let dedup = DedupRegistry::for_orders();
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = AtomicU64::new(0);

        intake(&dedup, &tx, &dropped, msg("O1", "1700000000001"));
        intake(&dedup, &tx, &dropped, msg("O2", "1700000000002"));

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        // The queued event is the older one; the newest was shed.
        let job = rx.try_recv().unwrap().unwrap();
        assert_eq!(job.msg.ord_id, "O1");
        assert!(rx.try_recv().is_err());
        // The shed event counts as handled so replays stay out of the queue.
        assert!(dedup.is_processed(&DedupKey::order("O2", 1_700_000_000_002)));
    }

    #[tokio::test]
    async fn bad_update_time_still_dedups() {
        let dedup = DedupRegistry::for_orders();
        let (tx, mut rx) = mpsc::channel(16);
        let dropped = AtomicU64::new(0);

        intake(&dedup, &tx, &dropped, msg("O1", "not-a-number"));
        assert!(rx.try_recv().is_ok());
        assert_eq!(dedup.inflight_len(), 1);
    }
}
