//! Durable bankroll ledger.
//!
//! Single-row balance plus a per-transaction journal, SQLite-backed with WAL
//! so the UI and worker threads can read while the engine writes. Every
//! mutating operation runs inside one explicit transaction under the
//! connection lock: concurrent callers serialize and a failure mid-operation
//! leaves no partial state.
//!
//! Settlement semantics: a reservation debits the stake; VOID credits the
//! stake back; SETTLED credits the payout only. A loss therefore settles at
//! payout 0 and permanently consumes the stake, and a win's payout is the
//! full amount credited on top of the already-spent stake.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    Pending,
    Settled,
    Void,
}

impl JournalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalStatus::Pending => "PENDING",
            JournalStatus::Settled => "SETTLED",
            JournalStatus::Void => "VOID",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "PENDING" => Ok(JournalStatus::Pending),
            "SETTLED" => Ok(JournalStatus::Settled),
            "VOID" => Ok(JournalStatus::Void),
            other => bail!("unknown journal status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tx_id: String,
    pub amount: f64,
    pub status: JournalStatus,
    pub payout: f64,
    /// Unix millis at reservation time.
    pub timestamp: i64,
}

/// SQLite-backed balance + journal store.
#[derive(Clone)]
pub struct BankrollLedger {
    conn: Arc<Mutex<Connection>>,
}

impl BankrollLedger {
    pub fn open(db_path: &str, starting_balance: f64) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open bankroll db {db_path}"))?;
        Self::from_connection(conn, starting_balance)
    }

    #[cfg(test)]
    pub fn open_in_memory(starting_balance: f64) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, starting_balance)
    }

    fn from_connection(conn: Connection, starting_balance: f64) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS balance (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_balance REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_id TEXT NOT NULL UNIQUE,
                amount REAL NOT NULL,
                status TEXT NOT NULL,
                payout REAL NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_journal_status_ts ON journal(status, timestamp ASC)",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO balance (id, current_balance) VALUES (1, ?1)",
            params![starting_balance],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current balance. Blocks only for lock acquisition.
    pub fn balance(&self) -> Result<f64> {
        let conn = self.conn.lock();
        let balance: f64 = conn.query_row(
            "SELECT current_balance FROM balance WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Create a PENDING journal entry and debit the stake atomically.
    /// On any failure nothing is written: the caller must treat a non-Ok
    /// result as "no reservation happened".
    pub fn reserve(&self, tx_id: &str, amount: f64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let balance: f64 = tx.query_row(
            "SELECT current_balance FROM balance WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        if balance < amount {
            bail!("insufficient ledger balance: {balance:.2} < {amount:.2}");
        }

        tx.execute(
            "INSERT INTO journal (tx_id, amount, status, payout, timestamp)
             VALUES (?1, ?2, 'PENDING', 0, ?3)",
            params![tx_id, amount, Utc::now().timestamp_millis()],
        )?;
        tx.execute(
            "UPDATE balance SET current_balance = current_balance - ?1 WHERE id = 1",
            params![amount],
        )?;

        tx.commit().context("commit reservation")?;
        debug!(tx_id, amount, "stake reserved");
        Ok(())
    }

    /// Mark an entry SETTLED and credit the payout when positive.
    ///
    /// Not idempotent by key: calling twice for the same tx_id credits the
    /// payout twice. The caller contract is exactly one settlement per tx_id.
    pub fn commit(&self, tx_id: &str, payout: f64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE journal SET status = 'SETTLED', payout = ?2 WHERE tx_id = ?1",
            params![tx_id, payout],
        )?;
        if updated == 0 {
            bail!("commit for unknown tx_id {tx_id}");
        }
        if payout > 0.0 {
            tx.execute(
                "UPDATE balance SET current_balance = current_balance + ?1 WHERE id = 1",
                params![payout],
            )?;
        }

        tx.commit().context("commit settlement")?;
        debug!(tx_id, payout, "entry settled");
        Ok(())
    }

    /// Void a PENDING entry and credit back its reserved amount. A tx_id with
    /// no PENDING entry is a no-op, so a refund races nothing.
    pub fn rollback(&self, tx_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let reserved: Option<f64> = tx
            .query_row(
                "SELECT amount FROM journal WHERE tx_id = ?1 AND status = 'PENDING'",
                params![tx_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(amount) = reserved else {
            warn!(tx_id, "rollback for non-pending tx_id ignored");
            return Ok(());
        };

        tx.execute(
            "UPDATE journal SET status = 'VOID' WHERE tx_id = ?1",
            params![tx_id],
        )?;
        tx.execute(
            "UPDATE balance SET current_balance = current_balance + ?1 WHERE id = 1",
            params![amount],
        )?;

        tx.commit().context("commit rollback")?;
        debug!(tx_id, amount, "reservation voided");
        Ok(())
    }

    /// All PENDING entries, oldest first.
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tx_id, amount, status, payout, timestamp
             FROM journal WHERE status = 'PENDING' ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (tx_id, amount, status, payout, timestamp) = row?;
            out.push(JournalEntry {
                tx_id,
                amount,
                status: JournalStatus::parse(&status)?,
                payout,
                timestamp,
            });
        }
        Ok(out)
    }

    pub fn entry(&self, tx_id: &str) -> Result<Option<JournalEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT tx_id, amount, status, payout, timestamp FROM journal WHERE tx_id = ?1",
                params![tx_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(tx_id, amount, status, payout, timestamp)| {
            Ok(JournalEntry {
                tx_id,
                amount,
                status: JournalStatus::parse(&status)?,
                payout,
                timestamp,
            })
        })
        .transpose()
    }

    /// Force every subsequent write to fail, as if the disk filled up.
    #[cfg(test)]
    pub fn break_storage_for_tests(&self) {
        let conn = self.conn.lock();
        conn.pragma_update(None, "query_only", "1").unwrap();
    }

    /// Authoritative overwrite used by reconciliation against the bookmaker.
    pub fn overwrite_balance(&self, value: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE balance SET current_balance = ?1 WHERE id = 1",
            params![value],
        )?;
        Ok(())
    }
}
