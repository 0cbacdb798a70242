//! SQLite-backed persistence for orders, position snapshots, trades and the
//! append-only trade action journal.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use skein_core::{
    ActionKind, MarginMode, OrderRecord, PositionSnapshot, Quantity, Trade, TradeAction,
    TradeState,
};

use crate::{LedgerError, LedgerResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    cloid TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    pos_side TEXT NOT NULL,
    signal_id INTEGER,
    current_size TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    leverage INTEGER NOT NULL,
    stop_loss_cloid TEXT,
    take_profit_cloid TEXT,
    state TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    closed_at TEXT
);

CREATE TABLE IF NOT EXISTS trade_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cloid TEXT,
    signal_id INTEGER,
    symbol TEXT NOT NULL,
    pos_side TEXT NOT NULL,
    kind TEXT NOT NULL,
    oid TEXT,
    amount TEXT,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trade_actions_cloid ON trade_actions(cloid);

CREATE TABLE IF NOT EXISTS orders (
    oid TEXT PRIMARY KEY,
    cloid TEXT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    pos_side TEXT NOT NULL,
    ord_type TEXT NOT NULL,
    px TEXT,
    sz TEXT NOT NULL,
    fill_px TEXT,
    fill_sz TEXT NOT NULL,
    state TEXT NOT NULL,
    leverage INTEGER,
    margin_mode TEXT,
    tag TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_cloid ON orders(cloid);

CREATE TABLE IF NOT EXISTS position_history (
    pid TEXT NOT NULL,
    u_time INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    pos_side TEXT NOT NULL,
    pos TEXT NOT NULL,
    avail_pos TEXT NOT NULL,
    avg_px TEXT NOT NULL,
    mark_px TEXT,
    lever INTEGER,
    margin_mode TEXT,
    PRIMARY KEY (pid, u_time)
);
"#;

/// Durable store shared by the ledger and the order store.
///
/// Journal rows are written synchronously on the worker that produced them;
/// readers observe the in-memory maps first, so the journal is only read at
/// startup and in tests.
pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (or create) the journal database at `path`.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                LedgerError::Journal(format!(
                    "failed to create journal directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory journal for tests and dry runs.
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_trade(&self, trade: &Trade) -> LedgerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO trades (
                cloid, symbol, pos_side, signal_id, current_size, entry_price,
                leverage, stop_loss_cloid, take_profit_cloid, state, opened_at, closed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(cloid) DO UPDATE SET
                current_size = excluded.current_size,
                entry_price = excluded.entry_price,
                leverage = excluded.leverage,
                stop_loss_cloid = excluded.stop_loss_cloid,
                take_profit_cloid = excluded.take_profit_cloid,
                state = excluded.state,
                closed_at = excluded.closed_at
            "#,
            params![
                trade.cloid,
                trade.symbol,
                trade.pos_side.as_str(),
                trade.signal_id,
                trade.current_size.to_string(),
                trade.entry_price.to_string(),
                trade.leverage,
                trade.stop_loss_cloid,
                trade.take_profit_cloid,
                trade.state.as_str(),
                trade.opened_at.to_rfc3339(),
                trade.closed_at.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Append one action row; returns its journal id.
    pub fn append_action(&self, action: &TradeAction) -> LedgerResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO trade_actions (cloid, signal_id, symbol, pos_side, kind, oid, amount, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                action.cloid,
                action.signal_id,
                action.symbol,
                action.pos_side.as_str(),
                action.kind.as_str(),
                action.oid,
                action.amount.map(|a| a.to_string()),
                action.ts.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fill in the amount of the oldest still-pending action of the given
    /// kind for a trade. Returns false when no pending row exists, in which
    /// case the caller appends a fresh row instead.
    pub fn complete_pending_action(
        &self,
        cloid: &str,
        kind: ActionKind,
        amount: Quantity,
        ts: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE trade_actions SET amount = ?1, ts = ?2
            WHERE id = (
                SELECT id FROM trade_actions
                WHERE cloid = ?3 AND kind = ?4 AND amount IS NULL
                ORDER BY id LIMIT 1
            )
            "#,
            params![
                amount.to_string(),
                ts.to_rfc3339(),
                cloid,
                kind.as_str()
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn upsert_order(&self, order: &OrderRecord) -> LedgerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO orders (
                oid, cloid, symbol, side, pos_side, ord_type, px, sz,
                fill_px, fill_sz, state, leverage, margin_mode, tag,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(oid) DO UPDATE SET
                cloid = COALESCE(excluded.cloid, orders.cloid),
                px = excluded.px,
                fill_px = excluded.fill_px,
                fill_sz = excluded.fill_sz,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                order.oid,
                order.cloid,
                order.symbol,
                order.side.as_str(),
                order.pos_side.as_str(),
                order.ord_type.as_str(),
                order.px.map(|p| p.to_string()),
                order.sz.to_string(),
                order.fill_px.map(|p| p.to_string()),
                order.fill_sz.to_string(),
                order.state.as_str(),
                order.leverage,
                order.margin_mode.map(MarginMode::as_str),
                order.tag,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Append-only snapshot insert; each `(pid, u_time)` is written once.
    /// Returns whether a new row was created.
    pub fn record_position_snapshot(&self, snap: &PositionSnapshot) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO position_history (
                pid, u_time, symbol, pos_side, pos, avail_pos, avg_px,
                mark_px, lever, margin_mode
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                snap.pid,
                snap.u_time,
                snap.symbol,
                snap.pos_side.as_str(),
                snap.pos.to_string(),
                snap.avail_pos.to_string(),
                snap.avg_px.to_string(),
                snap.mark_px.map(|p| p.to_string()),
                snap.lever,
                snap.margin_mode.map(MarginMode::as_str),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// All journaled actions for a trade (or every orphan row when `None`),
    /// oldest first.
    pub fn actions(&self, cloid: Option<&str>) -> LedgerResult<Vec<TradeAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT cloid, signal_id, symbol, pos_side, kind, oid, amount, ts
            FROM trade_actions
            WHERE (?1 IS NULL AND cloid IS NULL) OR cloid = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![cloid], |row| {
            Ok(RawAction {
                cloid: row.get(0)?,
                signal_id: row.get(1)?,
                symbol: row.get(2)?,
                pos_side: row.get(3)?,
                kind: row.get(4)?,
                oid: row.get(5)?,
                amount: row.get(6)?,
                ts: row.get(7)?,
            })
        })?;
        let mut actions = Vec::new();
        for raw in rows {
            actions.push(raw?.decode()?);
        }
        Ok(actions)
    }

    /// Load a single persisted order row.
    pub fn load_order(&self, oid: &str) -> LedgerResult<Option<OrderRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                r#"
                SELECT oid, cloid, symbol, side, pos_side, ord_type, px, sz,
                       fill_px, fill_sz, state, leverage, margin_mode, tag,
                       created_at, updated_at
                FROM orders WHERE oid = ?1
                "#,
                params![oid],
                RawOrder::from_row,
            )
            .optional()?;
        raw.map(RawOrder::decode).transpose()
    }

    /// Load a single trade row.
    pub fn load_trade(&self, cloid: &str) -> LedgerResult<Option<Trade>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                r#"
                SELECT cloid, symbol, pos_side, signal_id, current_size, entry_price,
                       leverage, stop_loss_cloid, take_profit_cloid, state, opened_at, closed_at
                FROM trades WHERE cloid = ?1
                "#,
                params![cloid],
                RawTrade::from_row,
            )
            .optional()?;
        raw.map(RawTrade::decode).transpose()
    }

    /// Load every trade that has not reached its terminal state, for state
    /// reconstruction after a restart.
    pub fn load_open_trades(&self) -> LedgerResult<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT cloid, symbol, pos_side, signal_id, current_size, entry_price,
                   leverage, stop_loss_cloid, take_profit_cloid, state, opened_at, closed_at
            FROM trades WHERE state != 'CLOSED'
            "#,
        )?;
        let rows = stmt.query_map([], RawTrade::from_row)?;
        let mut trades = Vec::new();
        for raw in rows {
            trades.push(raw?.decode()?);
        }
        Ok(trades)
    }
}

struct RawAction {
    cloid: Option<String>,
    signal_id: Option<i64>,
    symbol: String,
    pos_side: String,
    kind: String,
    oid: Option<String>,
    amount: Option<String>,
    ts: String,
}

impl RawAction {
    fn decode(self) -> LedgerResult<TradeAction> {
        Ok(TradeAction {
            cloid: self.cloid,
            signal_id: self.signal_id,
            symbol: self.symbol,
            pos_side: parse(&self.pos_side)?,
            kind: parse(&self.kind)?,
            oid: self.oid,
            amount: self.amount.as_deref().map(parse_decimal).transpose()?,
            ts: parse_timestamp(&self.ts)?,
        })
    }
}

struct RawOrder {
    oid: String,
    cloid: Option<String>,
    symbol: String,
    side: String,
    pos_side: String,
    ord_type: String,
    px: Option<String>,
    sz: String,
    fill_px: Option<String>,
    fill_sz: String,
    state: String,
    leverage: Option<u32>,
    margin_mode: Option<String>,
    tag: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawOrder {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            oid: row.get(0)?,
            cloid: row.get(1)?,
            symbol: row.get(2)?,
            side: row.get(3)?,
            pos_side: row.get(4)?,
            ord_type: row.get(5)?,
            px: row.get(6)?,
            sz: row.get(7)?,
            fill_px: row.get(8)?,
            fill_sz: row.get(9)?,
            state: row.get(10)?,
            leverage: row.get(11)?,
            margin_mode: row.get(12)?,
            tag: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn decode(self) -> LedgerResult<OrderRecord> {
        Ok(OrderRecord {
            oid: self.oid,
            cloid: self.cloid,
            symbol: self.symbol,
            side: parse(&self.side)?,
            pos_side: parse(&self.pos_side)?,
            ord_type: parse(&self.ord_type)?,
            px: self.px.as_deref().map(parse_decimal).transpose()?,
            sz: parse_decimal(&self.sz)?,
            fill_px: self.fill_px.as_deref().map(parse_decimal).transpose()?,
            fill_sz: parse_decimal(&self.fill_sz)?,
            state: parse(&self.state)?,
            leverage: self.leverage,
            margin_mode: self
                .margin_mode
                .as_deref()
                .map(parse::<MarginMode>)
                .transpose()?,
            tag: self.tag,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct RawTrade {
    cloid: String,
    symbol: String,
    pos_side: String,
    signal_id: Option<i64>,
    current_size: String,
    entry_price: String,
    leverage: u32,
    stop_loss_cloid: Option<String>,
    take_profit_cloid: Option<String>,
    state: String,
    opened_at: String,
    closed_at: Option<String>,
}

impl RawTrade {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cloid: row.get(0)?,
            symbol: row.get(1)?,
            pos_side: row.get(2)?,
            signal_id: row.get(3)?,
            current_size: row.get(4)?,
            entry_price: row.get(5)?,
            leverage: row.get(6)?,
            stop_loss_cloid: row.get(7)?,
            take_profit_cloid: row.get(8)?,
            state: row.get(9)?,
            opened_at: row.get(10)?,
            closed_at: row.get(11)?,
        })
    }

    fn decode(self) -> LedgerResult<Trade> {
        let state: TradeState = parse(&self.state)?;
        Ok(Trade {
            cloid: self.cloid,
            symbol: self.symbol,
            pos_side: parse(&self.pos_side)?,
            signal_id: self.signal_id,
            current_size: parse_decimal(&self.current_size)?,
            entry_price: parse_decimal(&self.entry_price)?,
            leverage: self.leverage,
            stop_loss_cloid: self.stop_loss_cloid,
            take_profit_cloid: self.take_profit_cloid,
            state,
            opened_at: parse_timestamp(&self.opened_at)?,
            closed_at: self.closed_at.as_deref().map(parse_timestamp).transpose()?,
            intent: None,
            last_external_utime: None,
        })
    }
}

fn parse<T: FromStr>(value: &str) -> LedgerResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| LedgerError::Corrupt(format!("{err}")))
}

fn parse_decimal(value: &str) -> LedgerResult<Decimal> {
    value
        .parse()
        .map_err(|err| LedgerError::Corrupt(format!("bad decimal '{value}': {err}")))
}

fn parse_timestamp(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| LedgerError::Corrupt(format!("bad timestamp '{value}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use skein_core::PosSide;

    fn sample_trade(cloid: &str) -> Trade {
        Trade {
            cloid: cloid.into(),
            symbol: "ETH-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            signal_id: Some(7),
            current_size: dec!(1.5),
            entry_price: dec!(3050.25),
            leverage: 3,
            stop_loss_cloid: None,
            take_profit_cloid: None,
            state: TradeState::Open,
            opened_at: Utc::now(),
            closed_at: None,
            intent: None,
            last_external_utime: None,
        }
    }

    #[test]
    fn trade_round_trips() {
        let journal = Journal::open_in_memory().unwrap();
        let trade = sample_trade("t1");
        journal.upsert_trade(&trade).unwrap();
        let loaded = journal.load_trade("t1").unwrap().unwrap();
        assert_eq!(loaded.current_size, dec!(1.5));
        assert_eq!(loaded.entry_price, dec!(3050.25));
        assert_eq!(loaded.state, TradeState::Open);
        assert!(journal.load_trade("missing").unwrap().is_none());
    }

    #[test]
    fn pending_action_completes_once() {
        let journal = Journal::open_in_memory().unwrap();
        journal
            .append_action(&TradeAction {
                cloid: Some("t1".into()),
                signal_id: None,
                symbol: "ETH-USDT-SWAP".into(),
                pos_side: PosSide::Long,
                kind: ActionKind::Close,
                oid: Some("o1".into()),
                amount: None,
                ts: Utc::now(),
            })
            .unwrap();

        assert!(journal
            .complete_pending_action("t1", ActionKind::Close, dec!(1), Utc::now())
            .unwrap());
        // No pending row remains.
        assert!(!journal
            .complete_pending_action("t1", ActionKind::Close, dec!(1), Utc::now())
            .unwrap());

        let actions = journal.actions(Some("t1")).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].amount, Some(dec!(1)));
    }

    #[test]
    fn orphan_actions_query_by_null_cloid() {
        let journal = Journal::open_in_memory().unwrap();
        journal
            .append_action(&TradeAction {
                cloid: None,
                signal_id: None,
                symbol: "ETH-USDT-SWAP".into(),
                pos_side: PosSide::Short,
                kind: ActionKind::ExternalClose,
                oid: None,
                amount: Some(dec!(0.4)),
                ts: Utc::now(),
            })
            .unwrap();
        let orphans = journal.actions(None).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].kind, ActionKind::ExternalClose);
    }

    #[test]
    fn position_snapshots_are_append_only() {
        let journal = Journal::open_in_memory().unwrap();
        let snap = PositionSnapshot {
            pid: "p1".into(),
            symbol: "ETH-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            pos: dec!(2),
            avail_pos: dec!(2),
            avg_px: dec!(3000),
            u_time: 1_700_000_000_000,
            mark_px: Some(dec!(3010)),
            lever: Some(3),
            margin_mode: None,
        };
        assert!(journal.record_position_snapshot(&snap).unwrap());
        assert!(!journal.record_position_snapshot(&snap).unwrap());
    }
}
