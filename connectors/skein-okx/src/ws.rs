//! Authenticated private websocket session.
//!
//! One transport owns one socket: a single task reads frames, writes login,
//! subscribe and heartbeat messages, and hands data frames to the registered
//! consumer. On any disconnect while running it waits the reconnect interval
//! and dials again, re-running login and subscription; a credential failure
//! halts the session instead and flips the health flag.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::json;
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::frames::{parse_frame, EventFrame, PrivateFrame};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// API credential triple for the private endpoints.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Private channels this transport can subscribe to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrivateChannel {
    Orders,
    Positions,
}

impl PrivateChannel {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Positions => "positions",
        }
    }
}

/// Settings for one streaming session.
#[derive(Clone)]
pub struct SessionConfig {
    pub url: String,
    pub credentials: Credentials,
    pub channels: Vec<PrivateChannel>,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
}

impl SessionConfig {
    /// Build a session config from the loaded stream settings.
    #[must_use]
    pub fn from_settings(
        stream: &skein_config::StreamConfig,
        sandbox: bool,
        credentials: Credentials,
        channels: Vec<PrivateChannel>,
    ) -> Self {
        Self {
            url: stream.resolve_private_url(sandbox),
            credentials,
            channels,
            heartbeat_interval: stream.heartbeat_interval(),
            ping_timeout: stream.ping_timeout(),
            reconnect_interval: stream.reconnect_interval(),
            connect_timeout: stream.connect_timeout(),
            subscribe_timeout: stream.subscribe_timeout(),
        }
    }
}

/// Point-in-time view of the session, for health reporting.
#[derive(Clone, Copy, Debug)]
pub struct SessionStatus {
    pub running: bool,
    pub connected: bool,
    pub logged_in: bool,
    pub subscribed_channels: usize,
    pub ready: bool,
    pub healthy: bool,
    pub reconnects: u32,
}

type FrameHandler = Arc<dyn Fn(PrivateFrame) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    running: AtomicBool,
    connected: AtomicBool,
    logged_in: AtomicBool,
    subscribed: AtomicUsize,
    healthy: AtomicBool,
    reconnects: AtomicU32,
    shutdown: Notify,
}

impl SessionState {
    fn reset_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        self.subscribed.store(0, Ordering::SeqCst);
    }
}

enum SessionExit {
    Shutdown,
    CredentialFailure,
    Disconnected(&'static str),
}

/// A single authenticated duplex stream to the private endpoint.
pub struct SessionTransport {
    config: SessionConfig,
    state: Arc<SessionState>,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionTransport {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let state = SessionState {
            healthy: AtomicBool::new(true),
            ..SessionState::default()
        };
        Self {
            config,
            state: Arc::new(state),
            handler: Arc::new(RwLock::new(None)),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Register the single frame consumer. Must be called before `start`.
    pub fn on_frame(&self, handler: impl Fn(PrivateFrame) + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Begin the connect loop. Idempotent.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.healthy.store(true, Ordering::SeqCst);
        let config = self.config.clone();
        let state = self.state.clone();
        let handler = self.handler.clone();
        let handle = tokio::spawn(async move {
            run_session(config, state, handler).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Graceful teardown; no further frames are delivered afterwards.
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(3), handle).await.is_err() {
                warn!("session task did not stop within 3s; aborting");
            }
        }
    }

    /// True iff connected, logged in and every channel is subscribed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
            && self.state.logged_in.load(Ordering::SeqCst)
            && self.state.subscribed.load(Ordering::SeqCst) >= self.config.channels.len()
    }

    /// False after a fatal credential failure.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            running: self.state.running.load(Ordering::SeqCst),
            connected: self.state.connected.load(Ordering::SeqCst),
            logged_in: self.state.logged_in.load(Ordering::SeqCst),
            subscribed_channels: self.state.subscribed.load(Ordering::SeqCst),
            ready: self.is_ready(),
            healthy: self.is_healthy(),
            reconnects: self.state.reconnects.load(Ordering::SeqCst),
        }
    }
}

async fn run_session(
    config: SessionConfig,
    state: Arc<SessionState>,
    handler: Arc<RwLock<Option<FrameHandler>>>,
) {
    let handler: FrameHandler = handler
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(|_frame| {}));
    let mut first_attempt = true;

    while state.running.load(Ordering::SeqCst) {
        if !first_attempt {
            state.reconnects.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = sleep(config.reconnect_interval) => {}
                _ = state.shutdown.notified() => break,
            }
            if !state.running.load(Ordering::SeqCst) {
                break;
            }
        }
        first_attempt = false;

        let socket = match timeout(config.connect_timeout, connect_async(&config.url)).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                warn!(url = %config.url, error = %err, "private session connect failed");
                continue;
            }
            Err(_) => {
                warn!(url = %config.url, "private session connect timed out");
                continue;
            }
        };

        info!(url = %config.url, "private session connected");
        state.connected.store(true, Ordering::SeqCst);
        let exit = drive_session(&config, &state, &handler, socket).await;
        state.reset_connection();
        match exit {
            SessionExit::Shutdown => break,
            SessionExit::CredentialFailure => {
                state.healthy.store(false, Ordering::SeqCst);
                error!("private session login rejected; halting session without reconnect");
                break;
            }
            SessionExit::Disconnected(reason) => {
                warn!(reason, "private session disconnected");
            }
        }
    }
    state.reset_connection();
    debug!("private session loop exited");
}

async fn drive_session(
    config: &SessionConfig,
    state: &SessionState,
    handler: &FrameHandler,
    mut socket: WsStream,
) -> SessionExit {
    let login = match login_request(&config.credentials) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to build login request");
            return SessionExit::CredentialFailure;
        }
    };
    if socket.send(Message::Text(login)).await.is_err() {
        return SessionExit::Disconnected("login send failed");
    }

    let mut heartbeat = interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let connected_at = Instant::now();
    let mut last_message = Instant::now();
    let mut pending_pong = false;
    let mut ping_sent_at = Instant::now();

    loop {
        tokio::select! {
            _ = state.shutdown.notified() => {
                let _ = socket.send(Message::Close(None)).await;
                return SessionExit::Shutdown;
            }
            message = socket.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(error = %err, "private socket read error");
                        return SessionExit::Disconnected("read error");
                    }
                    None => return SessionExit::Disconnected("stream ended"),
                };
                last_message = Instant::now();
                match message {
                    Message::Text(text) => {
                        match handle_text(config, state, handler, &mut socket, &text).await {
                            TextOutcome::Continue => {}
                            TextOutcome::Pong => pending_pong = false,
                            TextOutcome::Exit(exit) => return exit,
                        }
                    }
                    Message::Binary(bytes) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            match handle_text(config, state, handler, &mut socket, &text).await {
                                TextOutcome::Continue => {}
                                TextOutcome::Pong => pending_pong = false,
                                TextOutcome::Exit(exit) => return exit,
                            }
                        } else {
                            warn!("non UTF-8 binary payload on private socket");
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionExit::Disconnected("pong send failed");
                        }
                    }
                    Message::Pong(_) => pending_pong = false,
                    Message::Close(frame) => {
                        debug!(?frame, "server closed private socket");
                        return SessionExit::Disconnected("server close");
                    }
                    Message::Frame(_) => {}
                }
            }
            _ = heartbeat.tick() => {
                if !state.running.load(Ordering::SeqCst) {
                    let _ = socket.send(Message::Close(None)).await;
                    return SessionExit::Shutdown;
                }
                let now = Instant::now();
                if pending_pong && now.duration_since(ping_sent_at) >= config.ping_timeout {
                    return SessionExit::Disconnected("ping timeout");
                }
                let ready = state.subscribed.load(Ordering::SeqCst) >= config.channels.len();
                if !ready && now.duration_since(connected_at) >= config.subscribe_timeout {
                    return SessionExit::Disconnected("subscribe timeout");
                }
                if !pending_pong && now.duration_since(last_message) >= config.heartbeat_interval {
                    if socket.send(Message::Text("ping".into())).await.is_err() {
                        return SessionExit::Disconnected("ping send failed");
                    }
                    pending_pong = true;
                    ping_sent_at = now;
                }
            }
        }
    }
}

enum TextOutcome {
    Continue,
    Pong,
    Exit(SessionExit),
}

async fn handle_text(
    config: &SessionConfig,
    state: &SessionState,
    handler: &FrameHandler,
    socket: &mut WsStream,
    text: &str,
) -> TextOutcome {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, payload = %truncate(text), "dropping unparseable frame");
            return TextOutcome::Continue;
        }
    };
    match frame {
        PrivateFrame::Pong => TextOutcome::Pong,
        PrivateFrame::Event(event) => handle_event(config, state, socket, event).await,
        frame @ (PrivateFrame::Orders { .. } | PrivateFrame::Positions { .. }) => {
            handler(frame);
            TextOutcome::Continue
        }
        PrivateFrame::Unknown => {
            debug!(payload = %truncate(text), "ignoring frame for unconsumed channel");
            TextOutcome::Continue
        }
    }
}

async fn handle_event(
    config: &SessionConfig,
    state: &SessionState,
    socket: &mut WsStream,
    event: EventFrame,
) -> TextOutcome {
    match event.event.as_str() {
        "login" => {
            if event.is_ok() {
                info!("private session logged in");
                state.logged_in.store(true, Ordering::SeqCst);
                for channel in &config.channels {
                    let request = subscribe_request(*channel);
                    if socket.send(Message::Text(request)).await.is_err() {
                        return TextOutcome::Exit(SessionExit::Disconnected(
                            "subscribe send failed",
                        ));
                    }
                }
                TextOutcome::Continue
            } else {
                error!(
                    code = event.code.as_deref().unwrap_or("-"),
                    msg = event.msg.as_deref().unwrap_or(""),
                    "login rejected"
                );
                TextOutcome::Exit(SessionExit::CredentialFailure)
            }
        }
        "subscribe" => {
            if event.is_ok() {
                let count = state.subscribed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    channel = event.channel.as_deref().unwrap_or("-"),
                    subscribed = count,
                    "channel subscribed"
                );
                TextOutcome::Continue
            } else {
                warn!(
                    channel = event.channel.as_deref().unwrap_or("-"),
                    code = event.code.as_deref().unwrap_or("-"),
                    "subscribe rejected"
                );
                TextOutcome::Exit(SessionExit::Disconnected("subscribe rejected"))
            }
        }
        "error" => {
            // Errors before full readiness are treated as transient
            // subscription failures; afterwards they are logged and dropped.
            let ready = state.logged_in.load(Ordering::SeqCst)
                && state.subscribed.load(Ordering::SeqCst) >= config.channels.len();
            warn!(
                code = event.code.as_deref().unwrap_or("-"),
                msg = event.msg.as_deref().unwrap_or(""),
                "error event from venue"
            );
            if ready {
                TextOutcome::Continue
            } else {
                TextOutcome::Exit(SessionExit::Disconnected("error during setup"))
            }
        }
        other => {
            debug!(event = other, "ignoring unknown event");
            TextOutcome::Continue
        }
    }
}

/// Build the login frame: `sign = base64(hmacSHA256(secret, ts + "GET" +
/// "/users/self/verify"))` with `ts` in epoch seconds.
fn login_request(credentials: &Credentials) -> Result<String, String> {
    let timestamp = Utc::now().timestamp().to_string();
    let message = format!("{timestamp}GET/users/self/verify");
    let mut mac = HmacSha256::new_from_slice(credentials.secret.as_bytes())
        .map_err(|err| format!("failed to init signer: {err}"))?;
    mac.update(message.as_bytes());
    let sign = BASE64.encode(mac.finalize().into_bytes());
    Ok(json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }]
    })
    .to_string())
}

fn subscribe_request(channel: PrivateChannel) -> String {
    json!({
        "op": "subscribe",
        "args": [{
            "channel": channel.name(),
            "instType": "SWAP",
        }]
    })
    .to_string()
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_shape() {
        let payload = login_request(&Credentials {
            api_key: "key".into(),
            secret: "secret".into(),
            passphrase: "phrase".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["op"], "login");
        let arg = &value["args"][0];
        assert_eq!(arg["apiKey"], "key");
        assert_eq!(arg["passphrase"], "phrase");
        assert!(arg["sign"].as_str().is_some_and(|s| !s.is_empty()));
        // Timestamp is epoch seconds, not milliseconds.
        let ts: i64 = arg["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(ts < 100_000_000_000);
    }

    #[test]
    fn subscribe_request_shape() {
        let payload = subscribe_request(PrivateChannel::Positions);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "positions");
        assert_eq!(value["args"][0]["instType"], "SWAP");
    }

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        // Known-answer check of the HMAC construction.
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000GET/users/self/verify");
        let sign = BASE64.encode(mac.finalize().into_bytes());
        assert_eq!(sign.len(), 44);
    }
}
