//! Typed private-channel frames.
//!
//! The venue multiplexes control events (login/subscribe acks, errors) and
//! channel data over one socket; everything arrives as JSON text except the
//! literal `ping`/`pong` heartbeat frames.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use skein_core::{
    MarginMode, OrdType, OrderRecord, OrderState, PosSide, PositionSnapshot, Side,
};

/// Whether a data frame replays full current state or reports a delta.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Snapshot,
    EventUpdate,
}

impl FrameKind {
    fn from_label(label: Option<&str>) -> Self {
        match label {
            Some("snapshot") => Self::Snapshot,
            _ => Self::EventUpdate,
        }
    }
}

/// Control event: login/subscribe acknowledgement or an error report.
#[derive(Clone, Debug)]
pub struct EventFrame {
    pub event: String,
    pub code: Option<String>,
    pub msg: Option<String>,
    pub channel: Option<String>,
}

impl EventFrame {
    /// The venue reports success as code `"0"`; a missing code on an ack is
    /// treated as success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code.as_deref().map_or(true, |code| code == "0")
    }
}

/// One parsed frame off the private socket.
#[derive(Clone, Debug)]
pub enum PrivateFrame {
    Pong,
    Event(EventFrame),
    Orders {
        kind: FrameKind,
        data: Vec<OrderMsg>,
    },
    Positions {
        kind: FrameKind,
        data: Vec<PositionMsg>,
    },
    /// A channel or shape this connector does not consume.
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawArg {
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<RawArg>,
    #[serde(rename = "eventType", default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Parse one text payload into a typed frame.
pub fn parse_frame(text: &str) -> Result<PrivateFrame, serde_json::Error> {
    if text.trim() == "pong" {
        return Ok(PrivateFrame::Pong);
    }
    let raw: RawFrame = serde_json::from_str(text)?;

    if let Some(event) = raw.event {
        if event == "pong" {
            return Ok(PrivateFrame::Pong);
        }
        return Ok(PrivateFrame::Event(EventFrame {
            event,
            code: raw.code,
            msg: raw.msg,
            channel: raw.arg.map(|arg| arg.channel),
        }));
    }

    let (Some(arg), Some(data)) = (raw.arg, raw.data) else {
        return Ok(PrivateFrame::Unknown);
    };
    let kind = FrameKind::from_label(raw.event_type.as_deref());
    match arg.channel.as_str() {
        "orders" => Ok(PrivateFrame::Orders {
            kind,
            data: serde_json::from_value(data)?,
        }),
        "positions" => Ok(PrivateFrame::Positions {
            kind,
            data: serde_json::from_value(data)?,
        }),
        _ => Ok(PrivateFrame::Unknown),
    }
}

/// One element of an orders-channel `data[]` array.
#[derive(Clone, Debug, Deserialize)]
pub struct OrderMsg {
    #[serde(rename = "ordId", default)]
    pub ord_id: String,
    #[serde(rename = "clOrdId", default)]
    pub cl_ord_id: String,
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(rename = "ordType", default)]
    pub ord_type: String,
    #[serde(default)]
    pub px: String,
    #[serde(default)]
    pub sz: String,
    #[serde(rename = "accFillSz", default)]
    pub acc_fill_sz: String,
    #[serde(rename = "avgPx", default)]
    pub avg_px: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub lever: String,
    #[serde(rename = "tdMode", default)]
    pub td_mode: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "cTime", default)]
    pub c_time: String,
    #[serde(rename = "uTime", default)]
    pub u_time: String,
    #[serde(rename = "fillTime", default)]
    pub fill_time: String,
}

impl OrderMsg {
    /// Venue update time in milliseconds, when parseable.
    #[must_use]
    pub fn u_time_ms(&self) -> Option<i64> {
        parse_millis(&self.u_time)
    }

    /// Normalize into an [`OrderRecord`]. Returns `None` when essential
    /// fields are missing or carry labels this connector does not know.
    #[must_use]
    pub fn normalize(&self, received_at: DateTime<Utc>) -> Option<OrderRecord> {
        if self.ord_id.is_empty() || self.inst_id.is_empty() {
            return None;
        }
        let side: Side = self.side.parse().ok()?;
        let state: OrderState = self.state.parse().ok()?;
        let pos_side: PosSide = if self.pos_side.is_empty() {
            PosSide::Net
        } else {
            self.pos_side.parse().ok()?
        };
        let ord_type: OrdType = if self.ord_type.is_empty() {
            OrdType::Market
        } else {
            self.ord_type.parse().ok()?
        };
        let created_at = parse_millis(&self.c_time)
            .and_then(millis_to_datetime)
            .unwrap_or(received_at);
        let updated_at = parse_millis(&self.u_time)
            .and_then(millis_to_datetime)
            .unwrap_or(received_at);
        Some(OrderRecord {
            oid: self.ord_id.clone(),
            cloid: non_empty(&self.cl_ord_id),
            symbol: self.inst_id.clone(),
            side,
            pos_side,
            ord_type,
            px: parse_decimal(&self.px),
            sz: parse_decimal(&self.sz).unwrap_or(Decimal::ZERO),
            fill_px: parse_decimal(&self.avg_px),
            fill_sz: parse_decimal(&self.acc_fill_sz).unwrap_or(Decimal::ZERO),
            state,
            leverage: self.lever.parse().ok(),
            margin_mode: self.td_mode.parse::<MarginMode>().ok(),
            tag: non_empty(&self.tag),
            created_at,
            updated_at,
        })
    }
}

/// One element of a positions-channel `data[]` array.
#[derive(Clone, Debug, Deserialize)]
pub struct PositionMsg {
    #[serde(rename = "posId", default)]
    pub pos_id: String,
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(default)]
    pub pos: String,
    #[serde(rename = "availPos", default)]
    pub avail_pos: String,
    #[serde(rename = "avgPx", default)]
    pub avg_px: String,
    #[serde(rename = "uTime", default)]
    pub u_time: String,
    #[serde(rename = "markPx", default)]
    pub mark_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(rename = "mgnMode", default)]
    pub mgn_mode: String,
}

impl PositionMsg {
    /// Position size, treating empty strings and `"0"` as flat.
    #[must_use]
    pub fn pos_value(&self) -> Decimal {
        parse_decimal(&self.pos).unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn u_time_ms(&self) -> Option<i64> {
        parse_millis(&self.u_time)
    }

    #[must_use]
    pub fn pos_side_value(&self) -> Option<PosSide> {
        if self.pos_side.is_empty() {
            Some(PosSide::Net)
        } else {
            self.pos_side.parse().ok()
        }
    }

    /// Build the append-only snapshot row for this observation.
    #[must_use]
    pub fn snapshot(&self) -> Option<PositionSnapshot> {
        let pos_side = self.pos_side_value()?;
        Some(PositionSnapshot {
            pid: self.pos_id.clone(),
            symbol: self.inst_id.clone(),
            pos_side,
            pos: self.pos_value(),
            avail_pos: parse_decimal(&self.avail_pos).unwrap_or(Decimal::ZERO),
            avg_px: parse_decimal(&self.avg_px).unwrap_or(Decimal::ZERO),
            u_time: self.u_time_ms()?,
            mark_px: parse_decimal(&self.mark_px),
            lever: self.lever.parse().ok(),
            margin_mode: self.mgn_mode.parse::<MarginMode>().ok(),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    if value.is_empty() {
        None
    } else {
        value.parse().ok()
    }
}

fn parse_millis(value: &str) -> Option<i64> {
    if value.is_empty() {
        None
    } else {
        value.parse().ok()
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn literal_pong_parses() {
        assert!(matches!(parse_frame("pong").unwrap(), PrivateFrame::Pong));
        assert!(matches!(
            parse_frame(" pong \n").unwrap(),
            PrivateFrame::Pong
        ));
        assert!(matches!(
            parse_frame(r#"{"event":"pong"}"#).unwrap(),
            PrivateFrame::Pong
        ));
    }

    #[test]
    fn login_ack_parses_with_code() {
        let frame = parse_frame(r#"{"event":"login","code":"0","msg":""}"#).unwrap();
        let PrivateFrame::Event(event) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event.event, "login");
        assert!(event.is_ok());

        let frame = parse_frame(r#"{"event":"login","code":"50111","msg":"invalid key"}"#).unwrap();
        let PrivateFrame::Event(event) = frame else {
            panic!("expected event frame");
        };
        assert!(!event.is_ok());
    }

    #[test]
    fn position_frame_parses() {
        let text = r#"{
            "arg": {"channel": "positions", "instType": "SWAP"},
            "eventType": "event_update",
            "data": [{
                "posId": "P1", "instId": "ETH-USDT-SWAP", "posSide": "long",
                "pos": "0", "availPos": "0", "avgPx": "3000",
                "uTime": "1700000000001", "markPx": "3100", "lever": "3",
                "mgnMode": "cross"
            }]
        }"#;
        let PrivateFrame::Positions { kind, data } = parse_frame(text).unwrap() else {
            panic!("expected positions frame");
        };
        assert_eq!(kind, FrameKind::EventUpdate);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].pos_value(), Decimal::ZERO);
        assert_eq!(data[0].u_time_ms(), Some(1_700_000_000_001));

        let snap = data[0].snapshot().unwrap();
        assert_eq!(snap.mark_px, Some(dec!(3100)));
        assert_eq!(snap.lever, Some(3));
    }

    #[test]
    fn order_frame_normalizes() {
        let text = r#"{
            "arg": {"channel": "orders", "instType": "SWAP"},
            "data": [{
                "ordId": "O1", "clOrdId": "c1", "instId": "ETH-USDT-SWAP",
                "side": "buy", "posSide": "long", "ordType": "market",
                "sz": "2", "accFillSz": "1.5", "avgPx": "3001.5",
                "state": "partially_filled", "lever": "3", "tdMode": "cross",
                "uTime": "1700000000002", "cTime": "1700000000000"
            }]
        }"#;
        let PrivateFrame::Orders { data, .. } = parse_frame(text).unwrap() else {
            panic!("expected orders frame");
        };
        let record = data[0].normalize(Utc::now()).unwrap();
        assert_eq!(record.state, OrderState::PartiallyFilled);
        assert_eq!(record.fill_sz, dec!(1.5));
        assert_eq!(record.cloid.as_deref(), Some("c1"));
        assert_eq!(record.side, Side::Buy);
    }

    #[test]
    fn order_without_cloid_normalizes_to_none() {
        let msg = OrderMsg {
            ord_id: "O2".into(),
            cl_ord_id: String::new(),
            inst_id: "ETH-USDT-SWAP".into(),
            side: "sell".into(),
            pos_side: "long".into(),
            ord_type: "limit".into(),
            px: "3200".into(),
            sz: "1".into(),
            acc_fill_sz: "".into(),
            avg_px: "".into(),
            state: "live".into(),
            lever: "".into(),
            td_mode: "".into(),
            tag: "".into(),
            c_time: "".into(),
            u_time: "bad".into(),
            fill_time: "".into(),
        };
        let record = msg.normalize(Utc::now()).unwrap();
        assert!(record.cloid.is_none());
        assert_eq!(record.fill_sz, Decimal::ZERO);
        assert!(msg.u_time_ms().is_none());
    }

    #[test]
    fn unknown_channel_is_dropped_not_faulted() {
        let text = r#"{"arg": {"channel": "balance_and_position"}, "data": []}"#;
        assert!(matches!(parse_frame(text).unwrap(), PrivateFrame::Unknown));
        assert!(parse_frame("not json").is_err());
    }
}
