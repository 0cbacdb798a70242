//! End-to-end pipeline runs: mock venue socket -> session -> stream intake ->
//! bounded queues -> workers -> reconciliation engine -> ledger + journal.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde_json::json;
use tokio::time::sleep;

use skein_core::{ActionKind, PosSide, TradeState};
use skein_ledger::{Journal, OpenParams, ReconciliationEngine, OrderStore, TradeLedger};
use skein_okx::{
    Credentials, DedupRegistry, OrderStream, PositionStream, PrivateChannel, SessionConfig,
};
use skein_test_utils::{MockPrivateExchange, MockPrivateExchangeConfig, RecordingExchangeClient};

const SYMBOL: &str = "ETH-USDT-SWAP";

fn session_config(url: String) -> SessionConfig {
    SessionConfig {
        url,
        credentials: Credentials {
            api_key: "test-key".into(),
            secret: "test-secret".into(),
            passphrase: "test-phrase".into(),
        },
        channels: vec![PrivateChannel::Positions],
        heartbeat_interval: Duration::from_secs(20),
        ping_timeout: Duration::from_secs(5),
        reconnect_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(5),
        subscribe_timeout: Duration::from_secs(5),
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Rig {
    journal: Arc<Journal>,
    ledger: Arc<TradeLedger>,
    exchange: Arc<RecordingExchangeClient>,
    engine: Arc<ReconciliationEngine>,
}

fn rig() -> Rig {
    let journal = Arc::new(Journal::open_in_memory().unwrap());
    let ledger = Arc::new(TradeLedger::new(journal.clone()));
    let exchange = Arc::new(RecordingExchangeClient::new());
    let engine = Arc::new(ReconciliationEngine::new(ledger.clone(), exchange.clone()));
    Rig {
        journal,
        ledger,
        exchange,
        engine,
    }
}

async fn seed_open_trade(rig: &Rig, size: rust_decimal::Decimal) -> String {
    let cloid = rig
        .ledger
        .open(OpenParams {
            symbol: SYMBOL.into(),
            pos_side: PosSide::Long,
            size,
            leverage: 3,
            signal_id: Some(1),
            stop_loss_cloid: Some("sl-1".into()),
            take_profit_cloid: Some("tp-1".into()),
        })
        .unwrap();
    rig.ledger
        .record_submit(&cloid, "oid-open", ActionKind::Open)
        .await
        .unwrap();
    rig.ledger
        .apply_fill(&cloid, "oid-open", ActionKind::Open, size, Some(dec!(3000)))
        .await
        .unwrap();
    cloid
}

fn position_frame(pos: &str, u_time: &str, event_type: &str) -> serde_json::Value {
    json!({
        "arg": {"channel": "positions", "instType": "SWAP"},
        "eventType": event_type,
        "data": [{
            "posId": "P1", "instId": SYMBOL, "posSide": "long",
            "pos": pos, "availPos": pos, "avgPx": "3000",
            "uTime": u_time, "markPx": "3100", "lever": "3", "mgnMode": "cross"
        }]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn external_full_close_flows_to_the_ledger() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let rig = rig();
    let cloid = seed_open_trade(&rig, dec!(1)).await;

    let dedup = Arc::new(DedupRegistry::for_positions());
    let stream = PositionStream::new(
        session_config(mock.url()),
        dedup,
        rig.journal.clone(),
        rig.engine.clone(),
        200,
        100,
    );
    stream.start();
    eventually("stream ready", || stream.is_ready()).await;

    // Establish the last-known size, then report the external flat-out.
    mock.broadcast(position_frame("1", "1700000000000", "event_update"));
    mock.broadcast(position_frame("0", "1700000000001", "event_update"));

    eventually("trade closed", || {
        rig.exchange.canceled_algo_ids().len() == 2
    })
    .await;

    let trade = rig.ledger.get(&cloid).await.unwrap();
    assert_eq!(trade.state, TradeState::Closed);
    assert_eq!(trade.current_size, dec!(0));
    assert_eq!(rig.exchange.canceled_algo_ids(), vec!["sl-1", "tp-1"]);

    let externals: Vec<_> = rig
        .journal
        .actions(Some(&cloid))
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == ActionKind::ExternalClose)
        .collect();
    assert_eq!(externals.len(), 1);
    assert_eq!(externals[0].amount, Some(dec!(1)));

    // The pid binding was learned from the close correlation.
    assert_eq!(rig.ledger.resolve_pid("P1").as_deref(), Some(cloid.as_str()));

    stream.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_close_frames_produce_one_journal_row() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let rig = rig();
    let cloid = seed_open_trade(&rig, dec!(1)).await;

    let dedup = Arc::new(DedupRegistry::for_positions());
    let stream = PositionStream::new(
        session_config(mock.url()),
        dedup,
        rig.journal.clone(),
        rig.engine.clone(),
        200,
        100,
    );
    stream.start();
    eventually("stream ready", || stream.is_ready()).await;

    mock.broadcast(position_frame("1", "1700000000000", "event_update"));
    // The venue replays the same close event three times.
    for _ in 0..3 {
        mock.broadcast(position_frame("0", "1700000000001", "event_update"));
    }

    eventually("close applied", || {
        rig.exchange.canceled_algo_ids().len() == 2
    })
    .await;
    sleep(Duration::from_millis(300)).await;

    let externals = rig
        .journal
        .actions(Some(&cloid))
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == ActionKind::ExternalClose)
        .count();
    assert_eq!(externals, 1);
    assert_eq!(rig.exchange.canceled_algo_ids().len(), 2);

    stream.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_close_keeps_trade_open_without_algo_cancels() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let rig = rig();
    let cloid = seed_open_trade(&rig, dec!(2)).await;

    let dedup = Arc::new(DedupRegistry::for_positions());
    let stream = PositionStream::new(
        session_config(mock.url()),
        dedup,
        rig.journal.clone(),
        rig.engine.clone(),
        200,
        100,
    );
    stream.start();
    eventually("stream ready", || stream.is_ready()).await;

    mock.broadcast(position_frame("2", "1700000000000", "event_update"));
    mock.broadcast(position_frame("0.5", "1700000000001", "event_update"));

    eventually("partial close applied", || {
        let journal = rig.journal.actions(Some(&cloid)).unwrap();
        journal.iter().any(|a| a.kind == ActionKind::ExternalClose)
    })
    .await;

    let trade = rig.ledger.get(&cloid).await.unwrap();
    assert_eq!(trade.state, TradeState::Open);
    assert_eq!(trade.current_size, dec!(0.5));
    assert!(rig.exchange.canceled_algo_ids().is_empty());

    stream.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_snapshot_of_closed_trade_is_a_no_op() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let rig = rig();
    let cloid = seed_open_trade(&rig, dec!(1)).await;

    let dedup = Arc::new(DedupRegistry::for_positions());
    let stream = PositionStream::new(
        session_config(mock.url()),
        dedup,
        rig.journal.clone(),
        rig.engine.clone(),
        200,
        100,
    );
    stream.start();
    eventually("stream ready", || stream.is_ready()).await;

    mock.broadcast(position_frame("1", "1700000000000", "event_update"));
    mock.broadcast(position_frame("0", "1700000000001", "event_update"));
    eventually("close applied", || {
        rig.exchange.canceled_algo_ids().len() == 2
    })
    .await;
    let rows_after_close = rig.journal.actions(Some(&cloid)).unwrap().len();
    stream.stop().await;

    // A restarted consumer has no diff state and a cold dedup registry. The
    // venue's first snapshot replays the flat position, so a conservative
    // close event reaches the engine, which must treat it as settled.
    let fresh = PositionStream::new(
        session_config(mock.url()),
        Arc::new(DedupRegistry::for_positions()),
        rig.journal.clone(),
        rig.engine.clone(),
        200,
        100,
    );
    fresh.start();
    eventually("fresh stream ready", || fresh.is_ready()).await;
    mock.broadcast(position_frame("0", "1700000000099", "snapshot"));
    sleep(Duration::from_millis(300)).await;

    assert_eq!(
        rig.journal.actions(Some(&cloid)).unwrap().len(),
        rows_after_close
    );
    let trade = rig.ledger.get(&cloid).await.unwrap();
    assert_eq!(trade.state, TradeState::Closed);
    // No further conditional-order cancels were attempted.
    assert_eq!(rig.exchange.canceled_algo_ids().len(), 2);

    fresh.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn order_stream_applies_fills_to_the_trade() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let rig = rig();
    let cloid = rig
        .ledger
        .open(OpenParams {
            symbol: SYMBOL.into(),
            pos_side: PosSide::Long,
            size: dec!(2),
            leverage: 3,
            signal_id: None,
            stop_loss_cloid: None,
            take_profit_cloid: None,
        })
        .unwrap();
    rig.ledger
        .record_submit(&cloid, "O1", ActionKind::Open)
        .await
        .unwrap();

    let store = Arc::new(OrderStore::new(rig.journal.clone()));
    let dedup = Arc::new(DedupRegistry::for_orders());
    let stream = OrderStream::new(
        session_config(mock.url()),
        dedup,
        store.clone(),
        rig.engine.clone(),
        500,
        1,
    );
    stream.start();
    eventually("stream ready", || stream.is_ready()).await;

    let order_frame = |state: &str, acc: &str, u_time: &str| {
        json!({
            "arg": {"channel": "orders", "instType": "SWAP"},
            "data": [{
                "ordId": "O1", "clOrdId": cloid, "instId": SYMBOL,
                "side": "buy", "posSide": "long", "ordType": "market",
                "sz": "2", "accFillSz": acc, "avgPx": "3000",
                "state": state, "lever": "3", "tdMode": "cross",
                "uTime": u_time, "cTime": "1700000000000"
            }]
        })
    };

    mock.broadcast(order_frame("partially_filled", "0.5", "1700000000001"));
    mock.broadcast(order_frame("filled", "2", "1700000000002"));
    // Replay of the terminal frame must change nothing.
    mock.broadcast(order_frame("filled", "2", "1700000000002"));

    eventually("order filled", || {
        store
            .get("O1")
            .is_some_and(|record| record.state == skein_core::OrderState::Filled)
    })
    .await;
    eventually("fills journaled", || {
        let actions = rig.journal.actions(Some(&cloid)).unwrap();
        actions.iter().filter(|a| a.amount.is_some()).count() == 2
    })
    .await;
    sleep(Duration::from_millis(200)).await;

    let trade = rig.ledger.get(&cloid).await.unwrap();
    assert_eq!(trade.current_size, dec!(2));
    assert_eq!(trade.entry_price, dec!(3000));

    // Shutdown drains the workers promptly.
    let started = std::time::Instant::now();
    stream.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
}
