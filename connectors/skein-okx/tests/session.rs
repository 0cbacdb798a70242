use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;

use skein_okx::frames::PrivateFrame;
use skein_okx::{Credentials, PrivateChannel, SessionConfig, SessionTransport};
use skein_test_utils::{MockPrivateExchange, MockPrivateExchangeConfig};

fn session_config(url: String) -> SessionConfig {
    SessionConfig {
        url,
        credentials: Credentials {
            api_key: "test-key".into(),
            secret: "test-secret".into(),
            passphrase: "test-phrase".into(),
        },
        channels: vec![PrivateChannel::Positions],
        heartbeat_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(500),
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

#[tokio::test(flavor = "multi_thread")]
async fn becomes_ready_after_login_and_subscribe() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();

    eventually("session ready", || transport.is_ready()).await;
    assert!(transport.is_healthy());

    // Login must precede the subscribe request.
    let received = mock.received();
    assert!(received[0].contains("login"));
    assert!(received.iter().any(|m| m.contains("\"channel\":\"positions\"")));

    transport.stop().await;
    assert!(!transport.is_ready());
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_data_frames_in_receipt_order() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    transport.on_frame(move |frame| {
        if let PrivateFrame::Positions { data, .. } = frame {
            for msg in data {
                sink.lock().push(msg.u_time.clone());
            }
        }
    });
    transport.start();
    eventually("session ready", || transport.is_ready()).await;

    for u_time in ["1700000000001", "1700000000002", "1700000000003"] {
        mock.broadcast(json!({
            "arg": {"channel": "positions", "instType": "SWAP"},
            "eventType": "event_update",
            "data": [{
                "posId": "P1", "instId": "ETH-USDT-SWAP", "posSide": "long",
                "pos": "1", "availPos": "1", "avgPx": "3000",
                "uTime": u_time, "markPx": "3000"
            }]
        }));
    }

    eventually("three frames", || seen.lock().len() == 3).await;
    assert_eq!(
        *seen.lock(),
        vec!["1700000000001", "1700000000002", "1700000000003"]
    );
    transport.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn login_rejection_halts_without_reconnect() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig {
        login_code: "50111".into(),
        ..MockPrivateExchangeConfig::default()
    })
    .await
    .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();

    eventually("session unhealthy", || !transport.is_healthy()).await;
    assert!(!transport.is_ready());

    // Several reconnect intervals pass without a new dial or a subscribe.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.connection_count(), 1);
    assert!(!mock.received().iter().any(|m| m.contains("subscribe")));

    transport.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_and_resubscribes_after_drop() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();
    eventually("first session ready", || transport.is_ready()).await;

    mock.drop_connections();
    eventually("second connection", || mock.connection_count() >= 2).await;
    eventually("session ready again", || transport.is_ready()).await;

    assert!(transport.status().reconnects >= 1);
    // Login ran once per connection.
    let logins = mock
        .received()
        .iter()
        .filter(|m| m.contains("\"op\":\"login\""))
        .count();
    assert!(logins >= 2);
    transport.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pings_after_silence_and_stays_alive() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig::default())
        .await
        .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();
    eventually("session ready", || transport.is_ready()).await;

    eventually("heartbeat ping", || {
        mock.received().iter().any(|m| m.trim() == "ping")
    })
    .await;
    // Pong arrived, so the session survives the ping timeout window.
    sleep(Duration::from_millis(700)).await;
    assert!(transport.is_ready());
    assert_eq!(mock.connection_count(), 1);
    transport.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_pong_forces_reconnect() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig {
        respond_to_pings: false,
        ..MockPrivateExchangeConfig::default()
    })
    .await
    .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();
    eventually("session ready", || transport.is_ready()).await;

    // Silence triggers a ping; the ignored ping trips the pong timeout and
    // the session dials again.
    eventually("reconnect after ping timeout", || {
        mock.connection_count() >= 2
    })
    .await;
    transport.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_rejection_is_transient() {
    let mock = MockPrivateExchange::spawn(MockPrivateExchangeConfig {
        subscribe_code: "60012".into(),
        ..MockPrivateExchangeConfig::default()
    })
    .await
    .unwrap();
    let transport = SessionTransport::new(session_config(mock.url()));
    transport.on_frame(|_frame| {});
    transport.start();

    // Unlike a credential failure, a subscribe error keeps the session
    // healthy and retrying.
    eventually("retry after subscribe rejection", || {
        mock.connection_count() >= 2
    })
    .await;
    assert!(transport.is_healthy());
    assert!(!transport.is_ready());
    transport.stop().await;
}
