//! Scripted stand-in for the venue's private websocket endpoint.
//!
//! Accepts connections, answers login and subscribe requests with the
//! configured result codes, responds to literal `ping` heartbeats, and lets
//! tests inject arbitrary data frames or sever every connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Behavior knobs for the mock endpoint.
#[derive(Clone, Debug)]
pub struct MockPrivateExchangeConfig {
    /// Result code returned to login requests; `"0"` accepts.
    pub login_code: String,
    /// Result code returned to subscribe requests; `"0"` accepts.
    pub subscribe_code: String,
    /// Whether to answer literal `ping` frames with `pong`.
    pub respond_to_pings: bool,
}

impl Default for MockPrivateExchangeConfig {
    fn default() -> Self {
        Self {
            login_code: "0".into(),
            subscribe_code: "0".into(),
            respond_to_pings: true,
        }
    }
}

#[derive(Default)]
struct Shared {
    clients: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    connections: AtomicUsize,
    received: Mutex<Vec<String>>,
}

/// The running mock endpoint.
pub struct MockPrivateExchange {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockPrivateExchange {
    pub async fn spawn(config: MockPrivateExchangeConfig) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => {
                                let shared = accept_shared.clone();
                                let config = config.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = serve_client(shared, config, stream).await {
                                        warn!(error = %err, "mock client ended with error");
                                    }
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "mock accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    /// The websocket URL clients should dial.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/ws/v5/private", self.addr)
    }

    /// Number of connections accepted so far (dropped ones included).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// All text payloads received from clients, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.shared.received.lock().clone()
    }

    /// Push a data frame to every connected client.
    pub fn broadcast(&self, payload: Value) {
        let text = payload.to_string();
        let clients = self.shared.clients.lock();
        for client in clients.iter() {
            let _ = client.send(Message::Text(text.clone()));
        }
    }

    /// Sever every connection, as a flaky network would.
    pub fn drop_connections(&self) {
        let mut clients = self.shared.clients.lock();
        for client in clients.drain(..) {
            let _ = client.send(Message::Close(None));
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockPrivateExchange {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn serve_client(
    shared: Arc<Shared>,
    config: MockPrivateExchangeConfig,
    stream: TcpStream,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.clients.lock().push(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => {
                shared.received.lock().push(text.clone());
                handle_request(&config, &tx, &text);
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    shared
        .clients
        .lock()
        .retain(|client| !client.same_channel(&tx));
    drop(tx);
    let _ = writer.await;
    Ok(())
}

fn handle_request(
    config: &MockPrivateExchangeConfig,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    if text.trim() == "ping" {
        if config.respond_to_pings {
            let _ = tx.send(Message::Text("pong".into()));
        }
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    match value.get("op").and_then(|op| op.as_str()) {
        Some("login") => {
            let ack = json!({
                "event": "login",
                "code": config.login_code,
                "msg": if config.login_code == "0" { "" } else { "login failed" },
            });
            let _ = tx.send(Message::Text(ack.to_string()));
        }
        Some("subscribe") => {
            let channels: Vec<String> = value
                .get("args")
                .and_then(|args| args.as_array())
                .map(|args| {
                    args.iter()
                        .filter_map(|arg| arg.get("channel"))
                        .filter_map(|c| c.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            for channel in channels {
                let ack = if config.subscribe_code == "0" {
                    json!({
                        "event": "subscribe",
                        "arg": { "channel": channel, "instType": "SWAP" },
                        "code": "0",
                    })
                } else {
                    json!({
                        "event": "error",
                        "code": config.subscribe_code,
                        "msg": "subscribe failed",
                    })
                };
                let _ = tx.send(Message::Text(ack.to_string()));
            }
        }
        _ => {}
    }
}
