//! SQLite cache backend.
//!
//! Single-file store via `sqlx` with WAL mode. The schema mirrors the
//! wire data: blocks and transactions keyed by `(chain_id, hash)`, logs by
//! `(chain_id, block_hash, log_index)`, plus interval and checkpoint rows.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainfeed_core::{
    BlockInterval, CachedBlock, CachedLog, CachedTransaction, Checkpoint, IntervalSet,
    SourceFingerprint,
};

use crate::{CacheError, CacheStore};

/// SQLite-backed cache.
pub struct SqliteCache {
    pool: SqlitePool,
    /// Serializes interval merges: the merge is read-modify-write over
    /// the interval rows, so concurrent slice commits must not
    /// interleave. Block/log/tx inserts stay concurrent (idempotent on
    /// primary key).
    merge_lock: tokio::sync::Mutex<()>,
}

impl SqliteCache {
    /// Open (or create) a database at `path`. The path may be a plain file
    /// path or a full SQLite URL.
    pub async fn open(path: &str) -> Result<Self, CacheError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await?;
        let cache = Self {
            pool,
            merge_lock: tokio::sync::Mutex::new(()),
        };
        cache.init_schema().await?;
        Ok(cache)
    }

    /// Open an in-memory database. All data is lost when the pool drops;
    /// ideal for tests.
    ///
    /// SQLite scopes `:memory:` databases to a connection, so the pool is
    /// pinned to one connection or the schema would vanish between
    /// acquires.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let cache = Self {
            pool,
            merge_lock: tokio::sync::Mutex::new(()),
        };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn init_schema(&self) -> Result<(), CacheError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id    INTEGER NOT NULL,
                hash        TEXT    NOT NULL,
                parent_hash TEXT    NOT NULL,
                number      INTEGER NOT NULL,
                timestamp   INTEGER NOT NULL,
                gas_used    TEXT,
                miner       TEXT,
                PRIMARY KEY (chain_id, hash)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_blocks_number
             ON blocks (chain_id, number);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                chain_id     INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                log_index    INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                address      TEXT    NOT NULL,
                topic0       TEXT,
                topic1       TEXT,
                topic2       TEXT,
                topic3       TEXT,
                data         TEXT    NOT NULL,
                tx_hash      TEXT    NOT NULL,
                tx_index     INTEGER NOT NULL,
                PRIMARY KEY (chain_id, block_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_lookup
             ON logs (chain_id, address, topic0, block_number);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                chain_id  INTEGER NOT NULL,
                hash      TEXT    NOT NULL,
                block_hash TEXT   NOT NULL,
                tx_index  INTEGER NOT NULL,
                from_addr TEXT    NOT NULL,
                to_addr   TEXT,
                value     TEXT    NOT NULL,
                input     TEXT    NOT NULL,
                nonce     INTEGER NOT NULL,
                PRIMARY KEY (chain_id, hash)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS intervals (
                chain_id    INTEGER NOT NULL,
                fingerprint TEXT    NOT NULL,
                from_block  INTEGER NOT NULL,
                to_block    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_intervals
             ON intervals (chain_id, fingerprint);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id     INTEGER NOT NULL,
                source_name  TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                log_index    INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL,
                PRIMARY KEY (chain_id, source_name)
            );",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// Row → record converters, shared by the queries below.

fn log_from_row(row: &sqlx::sqlite::SqliteRow) -> CachedLog {
    let topics = [
        row.get::<Option<String>, _>("topic0"),
        row.get::<Option<String>, _>("topic1"),
        row.get::<Option<String>, _>("topic2"),
        row.get::<Option<String>, _>("topic3"),
    ]
    .into_iter()
    .flatten()
    .collect();
    CachedLog {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        block_hash: row.get("block_hash"),
        block_number: row.get::<i64, _>("block_number") as u64,
        log_index: row.get::<i64, _>("log_index") as u32,
        address: row.get("address"),
        topics,
        data: row.get("data"),
        tx_hash: row.get("tx_hash"),
        tx_index: row.get::<i64, _>("tx_index") as u32,
    }
}

fn block_from_row(row: &sqlx::sqlite::SqliteRow) -> CachedBlock {
    CachedBlock {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        hash: row.get("hash"),
        parent_hash: row.get("parent_hash"),
        number: row.get::<i64, _>("number") as u64,
        timestamp: row.get::<i64, _>("timestamp"),
        gas_used: row.get("gas_used"),
        miner: row.get("miner"),
    }
}

async fn insert_block_tx(
    conn: &mut sqlx::SqliteConnection,
    block: &CachedBlock,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO blocks (chain_id, hash, parent_hash, number, timestamp, gas_used, miner)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (chain_id, hash) DO NOTHING",
    )
    .bind(block.chain_id as i64)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(block.number as i64)
    .bind(block.timestamp)
    .bind(&block.gas_used)
    .bind(&block.miner)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_log_tx(
    conn: &mut sqlx::SqliteConnection,
    log: &CachedLog,
) -> Result<(), CacheError> {
    let topic = |i: usize| log.topics.get(i).cloned();
    sqlx::query(
        "INSERT INTO logs (chain_id, block_hash, log_index, block_number, address,
                           topic0, topic1, topic2, topic3, data, tx_hash, tx_index)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING",
    )
    .bind(log.chain_id as i64)
    .bind(&log.block_hash)
    .bind(log.log_index as i64)
    .bind(log.block_number as i64)
    .bind(&log.address)
    .bind(topic(0))
    .bind(topic(1))
    .bind(topic(2))
    .bind(topic(3))
    .bind(&log.data)
    .bind(&log.tx_hash)
    .bind(log.tx_index as i64)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_transaction_tx(
    conn: &mut sqlx::SqliteConnection,
    tx: &CachedTransaction,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO transactions (chain_id, hash, block_hash, tx_index, from_addr,
                                   to_addr, value, input, nonce)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (chain_id, hash) DO NOTHING",
    )
    .bind(tx.chain_id as i64)
    .bind(&tx.hash)
    .bind(&tx.block_hash)
    .bind(tx.tx_index as i64)
    .bind(&tx.from)
    .bind(&tx.to)
    .bind(&tx.value)
    .bind(&tx.input)
    .bind(tx.nonce as i64)
    .execute(conn)
    .await?;
    Ok(())
}

/// Merge `interval` into the stored set for `(chain_id, fingerprint)`
/// inside the caller's transaction: the merge is read-modify-write, so it
/// must not interleave with another writer for the same key.
async fn merge_interval_tx(
    conn: &mut sqlx::SqliteConnection,
    chain_id: u64,
    fingerprint: &SourceFingerprint,
    interval: BlockInterval,
) -> Result<(), CacheError> {
    let rows = sqlx::query(
        "SELECT from_block, to_block FROM intervals
         WHERE chain_id = ? AND fingerprint = ?",
    )
    .bind(chain_id as i64)
    .bind(fingerprint.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut set = IntervalSet::from_rows(rows.iter().map(|r| {
        (
            r.get::<i64, _>("from_block") as u64,
            r.get::<i64, _>("to_block") as u64,
        )
    }));
    set.insert(interval);

    sqlx::query("DELETE FROM intervals WHERE chain_id = ? AND fingerprint = ?")
        .bind(chain_id as i64)
        .bind(fingerprint.as_str())
        .execute(&mut *conn)
        .await?;

    for iv in set.as_slice() {
        sqlx::query(
            "INSERT INTO intervals (chain_id, fingerprint, from_block, to_block)
             VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id as i64)
        .bind(fingerprint.as_str())
        .bind(iv.from as i64)
        .bind(iv.to as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn insert_block(&self, block: &CachedBlock) -> Result<(), CacheError> {
        let mut conn = self.pool.acquire().await?;
        insert_block_tx(&mut conn, block).await
    }

    async fn insert_logs(&self, logs: &[CachedLog]) -> Result<(), CacheError> {
        let mut tx = self.pool.begin().await?;
        for log in logs {
            insert_log_tx(&mut tx, log).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_transactions(&self, txs: &[CachedTransaction]) -> Result<(), CacheError> {
        let mut tx = self.pool.begin().await?;
        for t in txs {
            insert_transaction_tx(&mut tx, t).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn has_block(&self, chain_id: u64, hash: &str) -> Result<bool, CacheError> {
        let row = sqlx::query("SELECT 1 AS one FROM blocks WHERE chain_id = ? AND hash = ?")
            .bind(chain_id as i64)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_interval(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
        interval: BlockInterval,
    ) -> Result<(), CacheError> {
        let _guard = self.merge_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        merge_interval_tx(&mut tx, chain_id, fingerprint, interval).await?;
        tx.commit().await?;
        debug!(chain_id, %fingerprint, %interval, "interval recorded");
        Ok(())
    }

    async fn cached_intervals(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
    ) -> Result<IntervalSet, CacheError> {
        let rows = sqlx::query(
            "SELECT from_block, to_block FROM intervals
             WHERE chain_id = ? AND fingerprint = ? ORDER BY from_block",
        )
        .bind(chain_id as i64)
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(IntervalSet::from_rows(rows.iter().map(|r| {
            (
                r.get::<i64, _>("from_block") as u64,
                r.get::<i64, _>("to_block") as u64,
            )
        })))
    }

    async fn commit_slice(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
        interval: BlockInterval,
        logs: &[CachedLog],
        blocks: &[CachedBlock],
        txs: &[CachedTransaction],
    ) -> Result<(), CacheError> {
        let _guard = self.merge_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for log in logs {
            insert_log_tx(&mut tx, log).await?;
        }
        for block in blocks {
            insert_block_tx(&mut tx, block).await?;
        }
        for t in txs {
            insert_transaction_tx(&mut tx, t).await?;
        }
        merge_interval_tx(&mut tx, chain_id, fingerprint, interval).await?;
        tx.commit().await?;
        debug!(
            chain_id,
            %fingerprint,
            %interval,
            logs = logs.len(),
            blocks = blocks.len(),
            "slice committed"
        );
        Ok(())
    }

    async fn logs_matching(
        &self,
        chain_id: u64,
        range: BlockInterval,
        addresses: &[String],
        selectors: &[String],
    ) -> Result<Vec<CachedLog>, CacheError> {
        let mut sql = String::from(
            "SELECT chain_id, block_hash, log_index, block_number, address,
                    topic0, topic1, topic2, topic3, data, tx_hash, tx_index
             FROM logs
             WHERE chain_id = ? AND block_number >= ? AND block_number <= ?",
        );
        if !addresses.is_empty() {
            sql.push_str(&format!(
                " AND address IN ({})",
                placeholders(addresses.len())
            ));
        }
        if !selectors.is_empty() {
            sql.push_str(&format!(
                " AND topic0 IN ({})",
                placeholders(selectors.len())
            ));
        }
        sql.push_str(" ORDER BY block_number, log_index");

        let mut query = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(range.from as i64)
            .bind(range.to as i64);
        for addr in addresses {
            query = query.bind(addr);
        }
        for sel in selectors {
            query = query.bind(sel);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(log_from_row).collect())
    }

    async fn block_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<CachedBlock>, CacheError> {
        let row = sqlx::query(
            "SELECT chain_id, hash, parent_hash, number, timestamp, gas_used, miner
             FROM blocks WHERE chain_id = ? AND hash = ?",
        )
        .bind(chain_id as i64)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(block_from_row))
    }

    async fn transaction_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<CachedTransaction>, CacheError> {
        let row = sqlx::query(
            "SELECT chain_id, hash, block_hash, tx_index, from_addr, to_addr, value, input, nonce
             FROM transactions WHERE chain_id = ? AND hash = ?",
        )
        .bind(chain_id as i64)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CachedTransaction {
            chain_id: r.get::<i64, _>("chain_id") as u64,
            hash: r.get("hash"),
            block_hash: r.get("block_hash"),
            tx_index: r.get::<i64, _>("tx_index") as u32,
            from: r.get("from_addr"),
            to: r.get("to_addr"),
            value: r.get("value"),
            input: r.get("input"),
            nonce: r.get::<i64, _>("nonce") as u64,
        }))
    }

    async fn delete_from_block(&self, chain_id: u64, block_number: u64) -> Result<(), CacheError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM logs WHERE chain_id = ? AND block_number >= ?")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        // Transactions reference their block by hash; purge them before
        // the block rows go away.
        sqlx::query(
            "DELETE FROM transactions WHERE chain_id = ? AND block_hash IN
             (SELECT hash FROM blocks WHERE chain_id = ? AND number >= ?)",
        )
        .bind(chain_id as i64)
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number >= ?")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM intervals WHERE chain_id = ? AND from_block >= ?")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        if block_number > 0 {
            sqlx::query(
                "UPDATE intervals SET to_block = ? WHERE chain_id = ? AND to_block >= ?",
            )
            .bind((block_number - 1) as i64)
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(chain_id, block_number, "cache truncated for rollback");
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        chain_id: u64,
        source_name: &str,
    ) -> Result<Option<Checkpoint>, CacheError> {
        let row = sqlx::query(
            "SELECT chain_id, source_name, block_number, log_index, updated_at
             FROM checkpoints WHERE chain_id = ? AND source_name = ?",
        )
        .bind(chain_id as i64)
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Checkpoint {
            chain_id: r.get::<i64, _>("chain_id") as u64,
            source_name: r.get("source_name"),
            block_number: r.get::<i64, _>("block_number") as u64,
            log_index: r.get::<i64, _>("log_index") as u32,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO checkpoints (chain_id, source_name, block_number, log_index, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, source_name) DO UPDATE SET
               block_number = excluded.block_number,
               log_index = excluded.log_index,
               updated_at = excluded.updated_at",
        )
        .bind(checkpoint.chain_id as i64)
        .bind(&checkpoint.source_name)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.log_index as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        debug!(
            source = %checkpoint.source_name,
            block = checkpoint.block_number,
            log_index = checkpoint.log_index,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete_checkpoint(&self, chain_id: u64, source_name: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ? AND source_name = ?")
            .bind(chain_id as i64)
            .bind(source_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
