//! OKX connector: private streaming session, order/position streams and the
//! REST trading client.
//!
//! Signing rules follow the venue's v5 API: requests carry an ISO-8601
//! millisecond timestamp and a base64 HMAC-SHA256 over
//! `timestamp + method + path + body`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use skein_broker::{
    AlgoKind, AlgoSubmission, ExchangeClient, ExchangeError, ExchangeResult, OrderSubmission,
    RateLimiter,
};
use skein_config::{ApiConfig, CredentialsConfig};
use skein_core::{ClientOrderId, OrderId};

pub mod dedup;
pub mod frames;
mod orders;
mod positions;
pub mod ws;

pub use dedup::DedupRegistry;
pub use orders::{OrderStream, OrderStreamStatus};
pub use positions::{PositionStream, PositionStreamStatus};
pub use ws::{Credentials, PrivateChannel, SessionConfig, SessionStatus, SessionTransport};

type HmacSha256 = Hmac<Sha256>;

const LIVE_REST_URL: &str = "https://www.okx.com";

/// Configuration for the REST trading client.
#[derive(Clone)]
pub struct OkxRestConfig {
    pub base_url: String,
    pub sandbox: bool,
    pub credentials: Credentials,
    pub api: ApiConfig,
}

impl OkxRestConfig {
    /// Build from loaded settings, deriving the endpoint from the sandbox
    /// switch unless explicitly overridden.
    #[must_use]
    pub fn from_settings(
        credentials: &CredentialsConfig,
        sandbox: bool,
        rest_url: Option<String>,
        api: ApiConfig,
    ) -> Self {
        Self {
            base_url: rest_url.unwrap_or_else(|| LIVE_REST_URL.to_string()),
            sandbox,
            credentials: Credentials {
                api_key: credentials.api_key.clone(),
                secret: credentials.secret.clone(),
                passphrase: credentials.passphrase.clone(),
            },
            api,
        }
    }
}

/// A thin wrapper over the venue's v5 trading REST API.
pub struct OkxRestClient {
    http: Client,
    config: OkxRestConfig,
    limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(rename = "ordId", default)]
    ord_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct AlgoAck {
    #[serde(rename = "algoClOrdId", default)]
    algo_cl_ord_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct EmptyAck {
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

impl OkxRestClient {
    pub fn new(config: OkxRestConfig) -> ExchangeResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.api.request_timeout())
            .build()
            .map_err(|err| ExchangeError::Other(format!("failed to build http client: {err}")))?;
        let limiter = RateLimiter::new(
            config.api.rate_limit,
            config.api.rate_window(),
            config.api.min_interval(),
        );
        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.credentials.secret.as_bytes())
            .map_err(|err| ExchangeError::Auth(format!("failed to init signer: {err}")))?;
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn post<T>(&self, path: &str, body: Value) -> ExchangeResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let body_text = body.to_string();
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match self.post_once(path, &body_text).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.api.max_retries => {
                    attempt += 1;
                    warn!(path, attempt, error = %err, "retrying request");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_once<T>(&self, path: &str, body: &str) -> ExchangeResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let sign = self.sign(&timestamp, "POST", path, body)?;
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut request = self
            .http
            .post(&url)
            .header("OK-ACCESS-KEY", &self.config.credentials.api_key)
            .header("OK-ACCESS-SIGN", sign)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.config.credentials.passphrase)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        if self.config.sandbox {
            request = request.header("x-simulated-trading", "1");
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ExchangeError::Timeout(err.to_string())
            } else {
                ExchangeError::Transport(err.to_string())
            }
        })?;
        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|err| ExchangeError::Serialization(err.to_string()))
    }

    fn ensure_ok<T>(&self, response: &ApiResponse<T>) -> ExchangeResult<()> {
        if response.code == "0" {
            Ok(())
        } else {
            Err(ExchangeError::Rejection(format!(
                "{} (code {})",
                response.msg, response.code
            )))
        }
    }
}

#[async_trait]
impl ExchangeClient for OkxRestClient {
    async fn submit_order(&self, request: OrderSubmission) -> ExchangeResult<OrderId> {
        let mut body = json!({
            "instId": request.symbol,
            "tdMode": request.margin_mode.as_str(),
            "clOrdId": request.cloid,
            "side": request.side.as_str(),
            "posSide": request.pos_side.as_str(),
            "ordType": request.ord_type.as_str(),
            "sz": request.sz.to_string(),
        });
        if let Some(px) = request.px {
            body["px"] = json!(px.to_string());
        }
        if let Some(tag) = &request.tag {
            body["tag"] = json!(tag);
        }
        if request.reduce_only {
            body["reduceOnly"] = json!(true);
        }
        let response: ApiResponse<OrderAck> = self.post("/api/v5/trade/order", body).await?;
        self.ensure_ok(&response)?;
        let ack = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Serialization("empty order response".into()))?;
        if ack.s_code != "0" && !ack.s_code.is_empty() {
            return Err(ExchangeError::Rejection(format!(
                "{} (sCode {})",
                ack.s_msg, ack.s_code
            )));
        }
        debug!(oid = %ack.ord_id, cloid = %request.cloid, "order submitted");
        Ok(ack.ord_id)
    }

    async fn cancel_order(&self, symbol: &str, oid: &str) -> ExchangeResult<()> {
        let body = json!({ "instId": symbol, "ordId": oid });
        let response: ApiResponse<EmptyAck> =
            self.post("/api/v5/trade/cancel-order", body).await?;
        self.ensure_ok(&response)?;
        Ok(())
    }

    async fn place_algo(&self, request: AlgoSubmission) -> ExchangeResult<ClientOrderId> {
        let mut body = json!({
            "instId": request.symbol,
            "tdMode": "cross",
            "side": request.side.as_str(),
            "posSide": request.pos_side.as_str(),
            "ordType": "conditional",
            "sz": request.sz.to_string(),
            "algoClOrdId": request.cloid,
        });
        let trigger = request.trigger_px.to_string();
        match request.kind {
            AlgoKind::StopLoss => {
                body["slTriggerPx"] = json!(trigger);
                body["slOrdPx"] = json!("-1");
            }
            AlgoKind::TakeProfit => {
                body["tpTriggerPx"] = json!(trigger);
                body["tpOrdPx"] = json!("-1");
            }
        }
        let response: ApiResponse<AlgoAck> = self.post("/api/v5/trade/order-algo", body).await?;
        self.ensure_ok(&response)?;
        let ack = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Serialization("empty algo response".into()))?;
        if ack.s_code != "0" && !ack.s_code.is_empty() {
            return Err(ExchangeError::Rejection(format!(
                "{} (sCode {})",
                ack.s_msg, ack.s_code
            )));
        }
        if ack.algo_cl_ord_id.is_empty() {
            Ok(request.cloid)
        } else {
            Ok(ack.algo_cl_ord_id)
        }
    }

    async fn cancel_algo(&self, symbol: &str, algo_cloid: &str) -> ExchangeResult<()> {
        let body = json!([{ "instId": symbol, "algoClOrdId": algo_cloid }]);
        let response: ApiResponse<EmptyAck> =
            self.post("/api/v5/trade/cancel-algos", body).await?;
        self.ensure_ok(&response)?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = json!({
            "instId": symbol,
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        });
        let response: ApiResponse<EmptyAck> =
            self.post("/api/v5/account/set-leverage", body).await?;
        self.ensure_ok(&response)?;
        Ok(())
    }
}
