//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod identifiers;

pub use identifiers::{new_client_order_id, validate_client_order_id};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for contract/coin quantity precision.
pub type Quantity = Decimal;
/// Alias used for venue instrument identifiers (e.g., `ETH-USDT-SWAP`).
pub type Symbol = String;

/// Identifier assigned by the exchange to a single order message.
pub type OrderId = String;
/// Process-assigned identifier, stable across every message of one logical trade.
pub type ClientOrderId = String;
/// Identifier assigned by the exchange to an open position.
pub type PositionId = String;

/// The side of an order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Wire representation used by the venue.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Direction of a held position in long/short margin mode.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
    /// One-way (netted) mode. Parsed and carried, never special-cased.
    Net,
}

impl PosSide {
    /// The order side that increases exposure for this position direction.
    #[must_use]
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long | Self::Net => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// The order side that reduces exposure for this position direction.
    #[must_use]
    pub fn exit_side(self) -> Side {
        self.entry_side().inverse()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::Net => "net",
        }
    }
}

/// Order execution style supported by the venue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrdType {
    Market,
    Limit,
    PostOnly,
    Fok,
    Ioc,
    Trigger,
}

impl OrdType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::PostOnly => "post_only",
            Self::Fok => "fok",
            Self::Ioc => "ioc",
            Self::Trigger => "trigger",
        }
    }
}

/// Margin mode of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cross => "cross",
            Self::Isolated => "isolated",
        }
    }
}

/// Lifecycle state of an individual exchange order.
///
/// States advance monotonically toward a terminal state; a store must never
/// replace a terminal state with an earlier one for the same order id.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl OrderState {
    /// True for states no later update may leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Live => 0,
            Self::PartiallyFilled => 1,
            Self::Filled | Self::Canceled | Self::Failed => 2,
        }
    }

    /// Whether a transition from `self` to `next` preserves monotonicity.
    #[must_use]
    pub fn accepts(self, next: Self) -> bool {
        if self.is_terminal() {
            next == self
        } else {
            next.rank() >= self.rank()
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

/// Normalized record of one exchange order, keyed by `oid`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRecord {
    pub oid: OrderId,
    /// Missing on orders placed outside this process.
    pub cloid: Option<ClientOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub pos_side: PosSide,
    pub ord_type: OrdType,
    pub px: Option<Price>,
    pub sz: Quantity,
    pub fill_px: Option<Price>,
    /// Cumulative filled quantity; never exceeds `sz`.
    pub fill_sz: Quantity,
    pub state: OrderState,
    pub leverage: Option<u32>,
    pub margin_mode: Option<MarginMode>,
    pub tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One observation of an exchange-held position, keyed by `(pid, u_time)`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PositionSnapshot {
    pub pid: PositionId,
    pub symbol: Symbol,
    pub pos_side: PosSide,
    /// Signed size; zero means the position is closed.
    pub pos: Quantity,
    pub avail_pos: Quantity,
    pub avg_px: Price,
    /// Venue-stamped update time in milliseconds.
    pub u_time: i64,
    pub mark_px: Option<Price>,
    pub lever: Option<u32>,
    pub margin_mode: Option<MarginMode>,
}

/// Lifecycle state of a logical trade.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Open,
    /// A local close was submitted and its confirmation is pending.
    Closing,
    Closed,
}

impl TradeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }
}

/// Pending locally-initiated exit, used to classify the next observed decrease.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum IntentKind {
    Reduce,
    Close,
}

/// Intent marker with its expiry deadline.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct CloseIntent {
    pub kind: IntentKind,
    pub expires_at: DateTime<Utc>,
}

impl CloseIntent {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A logical trade: the unit the ledger and the reconciler account for.
///
/// `current_size > 0` iff the trade is not closed; the size is the running
/// sum of entry fills minus exit fills and externally observed decreases.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub cloid: ClientOrderId,
    pub symbol: Symbol,
    pub pos_side: PosSide,
    pub signal_id: Option<i64>,
    pub current_size: Quantity,
    /// Size-weighted average entry price across open/add fills.
    pub entry_price: Price,
    pub leverage: u32,
    pub stop_loss_cloid: Option<ClientOrderId>,
    pub take_profit_cloid: Option<ClientOrderId>,
    pub state: TradeState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set while a locally submitted reduce/close awaits confirmation.
    pub intent: Option<CloseIntent>,
    /// Update time of the last externally observed decrease applied to this
    /// trade, used to ignore replays of the same position event.
    pub last_external_utime: Option<i64>,
}

impl Trade {
    /// Whether any exposure remains.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state != TradeState::Closed
    }

    /// The intent flag if it is present and still within its validity window.
    #[must_use]
    pub fn active_intent(&self, now: DateTime<Utc>) -> Option<IntentKind> {
        self.intent
            .filter(|intent| !intent.is_expired(now))
            .map(|intent| intent.kind)
    }
}

/// Kind of a journaled trade action.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Open,
    Add,
    Reduce,
    Close,
    ExternalClose,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Add => "ADD",
            Self::Reduce => "REDUCE",
            Self::Close => "CLOSE",
            Self::ExternalClose => "EXTERNAL_CLOSE",
        }
    }
}

/// Append-only journal row describing one mutation of a trade.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeAction {
    /// `None` for orphaned events that could not be correlated to a trade.
    pub cloid: Option<ClientOrderId>,
    pub signal_id: Option<i64>,
    pub symbol: Symbol,
    pub pos_side: PosSide,
    pub kind: ActionKind,
    pub oid: Option<OrderId>,
    /// `None` while the action is recorded pre-fill and its quantity is
    /// still pending.
    pub amount: Option<Quantity>,
    pub ts: DateTime<Utc>,
}

/// Externally observed position decrease emitted by the position stream.
#[derive(Clone, Debug)]
pub struct CloseEvent {
    pub pid: PositionId,
    pub symbol: Symbol,
    pub pos_side: PosSide,
    /// Quantity removed from the position. Zero when the previous size is
    /// unknown (post-reconnect snapshot); the ledger resolves the actual
    /// amount in that case.
    pub close_amount: Quantity,
    pub is_full_close: bool,
    pub u_time: i64,
    pub mark_px: Option<Price>,
}

/// Key identifying a single observation of a streamed update.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum DedupKey {
    Order { oid: OrderId, u_time: i64 },
    Position { pid: PositionId, u_time: i64 },
}

impl DedupKey {
    #[must_use]
    pub fn order(oid: impl Into<OrderId>, u_time: i64) -> Self {
        Self::Order {
            oid: oid.into(),
            u_time,
        }
    }

    #[must_use]
    pub fn position(pid: impl Into<PositionId>, u_time: i64) -> Self {
        Self::Position {
            pid: pid.into(),
            u_time,
        }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Order { oid, u_time } => write!(f, "order:{oid}@{u_time}"),
            Self::Position { pid, u_time } => write!(f, "position:{pid}@{u_time}"),
        }
    }
}

/// Error returned when parsing a persisted enum label fails.
#[derive(Clone, Debug)]
pub struct ParseEnumError {
    msg: String,
}

impl std::fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! impl_from_str {
    ($ty:ident, $kind:literal, { $($label:literal => $variant:ident),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        msg: format!(concat!("unknown ", $kind, ": '{}'"), other),
                    }),
                }
            }
        }
    };
}

impl_from_str!(Side, "side", { "buy" => Buy, "sell" => Sell });
impl_from_str!(PosSide, "position side", {
    "long" => Long,
    "short" => Short,
    "net" => Net,
});
impl_from_str!(OrdType, "order type", {
    "market" => Market,
    "limit" => Limit,
    "post_only" => PostOnly,
    "fok" => Fok,
    "ioc" => Ioc,
    "trigger" => Trigger,
});
impl_from_str!(OrderState, "order state", {
    "live" => Live,
    "partially_filled" => PartiallyFilled,
    "filled" => Filled,
    "canceled" => Canceled,
    "failed" => Failed,
});
impl_from_str!(MarginMode, "margin mode", {
    "cross" => Cross,
    "isolated" => Isolated,
});
impl_from_str!(TradeState, "trade state", {
    "OPEN" => Open,
    "CLOSING" => Closing,
    "CLOSED" => Closed,
});
impl_from_str!(ActionKind, "action kind", {
    "OPEN" => Open,
    "ADD" => Add,
    "REDUCE" => Reduce,
    "CLOSE" => Close,
    "EXTERNAL_CLOSE" => ExternalClose,
});
