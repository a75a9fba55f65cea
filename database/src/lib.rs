//! Share Store for lodepool
//!
//! Durable relational persistence for everything the pool owes its
//! miners: accepted shares, the payout periods they roll into, the
//! pool-credited blocks funding those periods, and the payout
//! transactions that settle them. Uses SQLite with one write
//! transaction per logical mutation; readers observe committed state.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

/// Share store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A state transition the schema forbids
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// An accepted share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub id: i64,
    pub payout_period_id: i64,
    pub public_address: String,
    pub created_at_ms: i64,
    pub payout_transaction_id: Option<i64>,
}

/// A time-bounded accumulation window for shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutPeriod {
    pub id: i64,
    pub start_ms: i64,
    /// `None` while the period is open
    pub end_ms: Option<i64>,
}

/// A block the pool found and was credited for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBlock {
    pub id: i64,
    pub payout_period_id: i64,
    pub sequence: u32,
    pub hash: String,
    pub miner_reward: u64,
    pub main: bool,
    pub confirmed: bool,
}

/// An on-chain payout transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutTransaction {
    pub id: i64,
    pub payout_period_id: i64,
    pub hash: String,
    pub confirmed: bool,
    pub expired: bool,
}

/// An address owed payment, with its share count in a period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutAddress {
    pub public_address: String,
    pub share_count: u64,
}

/// SQLite-backed share store
pub struct ShareStore {
    /// Database connection; writes are serialized through this lock
    conn: Arc<Mutex<Connection>>,
}

impl ShareStore {
    /// Open (or create) the share store at the given path
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        Self::create_tables(&conn)?;
        info!("Share store opened at {}", db_path.display());

        Ok(ShareStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store, used by tests
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(ShareStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create database tables
    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS payout_period (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS payout_transaction (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payout_period_id INTEGER NOT NULL,
                hash TEXT NOT NULL,
                confirmed INTEGER NOT NULL DEFAULT 0,
                expired INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(payout_period_id) REFERENCES payout_period(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payout_period_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                hash TEXT NOT NULL,
                miner_reward INTEGER NOT NULL,
                main INTEGER NOT NULL DEFAULT 1,
                confirmed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(payout_period_id) REFERENCES payout_period(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS share (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payout_period_id INTEGER NOT NULL,
                public_address TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                payout_transaction_id INTEGER,
                FOREIGN KEY(payout_period_id) REFERENCES payout_period(id),
                FOREIGN KEY(payout_transaction_id) REFERENCES payout_transaction(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_share_period ON share(payout_period_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_share_address_time ON share(public_address, created_at_ms)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_share_transaction ON share(payout_transaction_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_block_period ON block(payout_period_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transaction_period ON payout_transaction(payout_period_id)",
            [],
        )?;

        Ok(())
    }

    /// Id of the open payout period, creating the first one if none exists
    fn ensure_current_period(conn: &Connection, now_ms: i64) -> Result<i64, rusqlite::Error> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM payout_period WHERE end_ms IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => Ok(id),
            None => {
                conn.execute(
                    "INSERT INTO payout_period (start_ms) VALUES (?)",
                    params![now_ms],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Record an accepted share for a payout address
    pub async fn new_share(&self, public_address: &str) -> Result<i64, StoreError> {
        let now_ms = lodepool_util::now_ms();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let period_id = Self::ensure_current_period(&tx, now_ms)?;
        tx.execute(
            "INSERT INTO share (payout_period_id, public_address, created_at_ms) VALUES (?, ?, ?)",
            params![period_id, public_address, now_ms],
        )?;
        let id = tx.last_insert_rowid();

        tx.commit()?;
        debug!("Recorded share {} for {}", id, public_address);
        Ok(id)
    }

    /// Record a block credited to the pool. The reward is stored as a
    /// positive amount regardless of the caller's sign convention.
    pub async fn new_block(
        &self,
        sequence: u32,
        hash: &str,
        miner_reward: i64,
    ) -> Result<i64, StoreError> {
        let now_ms = lodepool_util::now_ms();
        let reward = miner_reward.unsigned_abs();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let period_id = Self::ensure_current_period(&tx, now_ms)?;
        tx.execute(
            "INSERT INTO block (payout_period_id, sequence, hash, miner_reward) VALUES (?, ?, ?, ?)",
            params![period_id, sequence, hash, reward],
        )?;
        let id = tx.last_insert_rowid();

        tx.commit()?;
        info!("Recorded block {} at sequence {} with reward {}", hash, sequence, reward);
        Ok(id)
    }

    /// The unique open payout period, if any
    pub async fn current_payout_period(&self) -> Result<Option<PayoutPeriod>, StoreError> {
        let conn = self.conn.lock().await;
        let period = conn
            .query_row(
                "SELECT id, start_ms, end_ms FROM payout_period WHERE end_ms IS NULL",
                [],
                row_to_period,
            )
            .optional()?;
        Ok(period)
    }

    /// Close the open payout period at `now_ms` and open its successor.
    /// With no open period this just opens the first one.
    pub async fn rollover_payout_period(&self, now_ms: i64) -> Result<PayoutPeriod, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE payout_period SET end_ms = ? WHERE end_ms IS NULL",
            params![now_ms],
        )?;
        tx.execute(
            "INSERT INTO payout_period (start_ms) VALUES (?)",
            params![now_ms],
        )?;
        let id = tx.last_insert_rowid();

        tx.commit()?;
        info!("Opened payout period {}", id);
        Ok(PayoutPeriod {
            id,
            start_ms: now_ms,
            end_ms: None,
        })
    }

    /// Shares not yet attached to a payout transaction
    pub async fn shares_pending_payout(
        &self,
        public_address: Option<&str>,
    ) -> Result<Vec<Share>, StoreError> {
        let conn = self.conn.lock().await;
        let mut shares = Vec::new();

        match public_address {
            Some(address) => {
                let mut stmt = conn.prepare(
                    "SELECT id, payout_period_id, public_address, created_at_ms, payout_transaction_id
                     FROM share WHERE payout_transaction_id IS NULL AND public_address = ?
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(params![address], row_to_share)?;
                for row in rows {
                    shares.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, payout_period_id, public_address, created_at_ms, payout_transaction_id
                     FROM share WHERE payout_transaction_id IS NULL ORDER BY id",
                )?;
                let rows = stmt.query_map([], row_to_share)?;
                for row in rows {
                    shares.push(row?);
                }
            }
        }

        Ok(shares)
    }

    /// Number of shares recorded at or after `since_ms`
    pub async fn share_count_since(
        &self,
        since_ms: i64,
        public_address: Option<&str>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = match public_address {
            Some(address) => conn.query_row(
                "SELECT COUNT(*) FROM share WHERE created_at_ms >= ? AND public_address = ?",
                params![since_ms, address],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM share WHERE created_at_ms >= ?",
                params![since_ms],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    /// Blocks whose confirmation status is still being tracked
    pub async fn unconfirmed_blocks(&self) -> Result<Vec<PoolBlock>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, payout_period_id, sequence, hash, miner_reward, main, confirmed
             FROM block WHERE confirmed = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    /// Update a block's chain status. No-op when both values are unchanged.
    pub async fn update_block_status(
        &self,
        id: i64,
        main: bool,
        confirmed: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE block SET main = ?2, confirmed = ?3
             WHERE id = ?1 AND (main != ?2 OR confirmed != ?3)",
            params![id, main, confirmed],
        )?;
        Ok(())
    }

    /// Payout transactions that are neither confirmed nor expired
    pub async fn unconfirmed_transactions(&self) -> Result<Vec<PayoutTransaction>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, payout_period_id, hash, confirmed, expired
             FROM payout_transaction WHERE confirmed = 0 AND expired = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_transaction)?;

        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        Ok(transactions)
    }

    /// The oldest sealed period still holding a share whose payout
    /// transaction has not confirmed
    pub async fn earliest_outstanding_payout_period(
        &self,
    ) -> Result<Option<PayoutPeriod>, StoreError> {
        let conn = self.conn.lock().await;
        let period = conn
            .query_row(
                "SELECT p.id, p.start_ms, p.end_ms FROM payout_period p
                 WHERE p.end_ms IS NOT NULL
                   AND EXISTS (
                     SELECT 1 FROM share s
                     LEFT JOIN payout_transaction t ON s.payout_transaction_id = t.id
                     WHERE s.payout_period_id = p.id
                       AND (s.payout_transaction_id IS NULL OR t.confirmed = 0)
                   )
                 ORDER BY p.start_ms ASC
                 LIMIT 1",
                [],
                row_to_period,
            )
            .optional()?;
        Ok(period)
    }

    /// Whether every block of the period has reached confirmed status
    pub async fn payout_period_blocks_confirmed(&self, period_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM block WHERE payout_period_id = ? AND confirmed = 0",
            params![period_id],
            |row| row.get(0),
        )?;
        Ok(pending == 0)
    }

    /// Total shares recorded in the period
    pub async fn payout_period_share_count(&self, period_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM share WHERE payout_period_id = ?",
            params![period_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Addresses owed payment in the period, with unpaid share counts
    pub async fn payout_addresses(&self, period_id: i64) -> Result<Vec<PayoutAddress>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT public_address, COUNT(*) FROM share
             WHERE payout_period_id = ? AND payout_transaction_id IS NULL
             GROUP BY public_address ORDER BY public_address",
        )?;
        let rows = stmt.query_map(params![period_id], |row| {
            let public_address: String = row.get(0)?;
            let share_count: i64 = row.get(1)?;
            Ok(PayoutAddress {
                public_address,
                share_count: share_count as u64,
            })
        })?;

        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }

    /// Sum of miner rewards over the period's main, confirmed blocks
    pub async fn payout_reward(&self, period_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let reward: i64 = conn.query_row(
            "SELECT COALESCE(SUM(miner_reward), 0) FROM block
             WHERE payout_period_id = ? AND main = 1 AND confirmed = 1",
            params![period_id],
            |row| row.get(0),
        )?;
        Ok(reward as u64)
    }

    /// Record a freshly sent payout transaction
    pub async fn new_transaction(&self, hash: &str, period_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO payout_transaction (payout_period_id, hash) VALUES (?, ?)",
            params![period_id, hash],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update a payout transaction's status. No-op when unchanged;
    /// rejects the impossible confirmed-and-expired combination.
    pub async fn update_transaction_status(
        &self,
        id: i64,
        confirmed: bool,
        expired: bool,
    ) -> Result<(), StoreError> {
        if confirmed && expired {
            return Err(StoreError::InvalidState(
                "a payout transaction cannot be both confirmed and expired".to_string(),
            ));
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE payout_transaction SET confirmed = ?2, expired = ?3
             WHERE id = ?1 AND (confirmed != ?2 OR expired != ?3)",
            params![id, confirmed, expired],
        )?;
        Ok(())
    }

    /// Attach the unpaid shares of the given addresses to a payout
    /// transaction, all under one write transaction
    pub async fn mark_shares_paid(
        &self,
        period_id: i64,
        transaction_id: i64,
        addresses: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for address in addresses {
            tx.execute(
                "UPDATE share SET payout_transaction_id = ?
                 WHERE payout_period_id = ? AND public_address = ? AND payout_transaction_id IS NULL",
                params![transaction_id, period_id, address],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Detach every share referencing a payout transaction, making its
    /// period outstanding again
    pub async fn mark_shares_unpaid(&self, transaction_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE share SET payout_transaction_id = NULL WHERE payout_transaction_id = ?",
            params![transaction_id],
        )?;
        info!("Released {} shares from expired transaction {}", changed, transaction_id);
        Ok(())
    }

    /// Delete the period's unpaid shares; used when a period's reward
    /// turns out to be zero
    pub async fn delete_unpayable_shares(&self, period_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM share WHERE payout_period_id = ? AND payout_transaction_id IS NULL",
            params![period_id],
        )?;
        info!("Deleted {} unpayable shares from period {}", deleted, period_id);
        Ok(())
    }
}

fn row_to_share(row: &rusqlite::Row<'_>) -> rusqlite::Result<Share> {
    Ok(Share {
        id: row.get(0)?,
        payout_period_id: row.get(1)?,
        public_address: row.get(2)?,
        created_at_ms: row.get(3)?,
        payout_transaction_id: row.get(4)?,
    })
}

fn row_to_period(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayoutPeriod> {
    Ok(PayoutPeriod {
        id: row.get(0)?,
        start_ms: row.get(1)?,
        end_ms: row.get(2)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<PoolBlock> {
    let sequence: i64 = row.get(2)?;
    let miner_reward: i64 = row.get(4)?;
    Ok(PoolBlock {
        id: row.get(0)?,
        payout_period_id: row.get(1)?,
        sequence: sequence as u32,
        hash: row.get(3)?,
        miner_reward: miner_reward as u64,
        main: row.get(5)?,
        confirmed: row.get(6)?,
    })
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayoutTransaction> {
    Ok(PayoutTransaction {
        id: row.get(0)?,
        payout_period_id: row.get(1)?,
        hash: row.get(2)?,
        confirmed: row.get(3)?,
        expired: row.get(4)?,
    })
}
