//! PostgreSQL cache backend.
//!
//! Mirrors the SQLite backend's contract for server-based deployments.
//! Numbered parameters and BIGINT columns aside, the SQL is the same.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use chainfeed_core::{
    BlockInterval, CachedBlock, CachedLog, CachedTransaction, Checkpoint, IntervalSet,
    SourceFingerprint,
};

use crate::{CacheError, CacheStore};

/// Postgres-backed cache.
pub struct PostgresCache {
    pool: PgPool,
    /// Serializes interval merges; see the SQLite backend.
    merge_lock: tokio::sync::Mutex<()>,
}

impl PostgresCache {
    /// Connect using a `postgres://` connection string.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let pool = PgPool::connect(url).await?;
        let cache = Self {
            pool,
            merge_lock: tokio::sync::Mutex::new(()),
        };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn init_schema(&self) -> Result<(), CacheError> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id    BIGINT NOT NULL,
                hash        TEXT   NOT NULL,
                parent_hash TEXT   NOT NULL,
                number      BIGINT NOT NULL,
                timestamp   BIGINT NOT NULL,
                gas_used    TEXT,
                miner       TEXT,
                PRIMARY KEY (chain_id, hash)
            )",
            "CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (chain_id, number)",
            "CREATE TABLE IF NOT EXISTS logs (
                chain_id     BIGINT NOT NULL,
                block_hash   TEXT   NOT NULL,
                log_index    BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                address      TEXT   NOT NULL,
                topic0       TEXT,
                topic1       TEXT,
                topic2       TEXT,
                topic3       TEXT,
                data         TEXT   NOT NULL,
                tx_hash      TEXT   NOT NULL,
                tx_index     BIGINT NOT NULL,
                PRIMARY KEY (chain_id, block_hash, log_index)
            )",
            "CREATE INDEX IF NOT EXISTS idx_logs_lookup
             ON logs (chain_id, address, topic0, block_number)",
            "CREATE TABLE IF NOT EXISTS transactions (
                chain_id   BIGINT NOT NULL,
                hash       TEXT   NOT NULL,
                block_hash TEXT   NOT NULL,
                tx_index   BIGINT NOT NULL,
                from_addr  TEXT   NOT NULL,
                to_addr    TEXT,
                value      TEXT   NOT NULL,
                input      TEXT   NOT NULL,
                nonce      BIGINT NOT NULL,
                PRIMARY KEY (chain_id, hash)
            )",
            "CREATE TABLE IF NOT EXISTS intervals (
                chain_id    BIGINT NOT NULL,
                fingerprint TEXT   NOT NULL,
                from_block  BIGINT NOT NULL,
                to_block    BIGINT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_intervals ON intervals (chain_id, fingerprint)",
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id     BIGINT NOT NULL,
                source_name  TEXT   NOT NULL,
                block_number BIGINT NOT NULL,
                log_index    BIGINT NOT NULL,
                updated_at   BIGINT NOT NULL,
                PRIMARY KEY (chain_id, source_name)
            )",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn log_from_row(row: &sqlx::postgres::PgRow) -> CachedLog {
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

async fn insert_block_tx(
    conn: &mut sqlx::PgConnection,
    block: &CachedBlock,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO blocks (chain_id, hash, parent_hash, number, timestamp, gas_used, miner)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
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
    conn: &mut sqlx::PgConnection,
    log: &CachedLog,
) -> Result<(), CacheError> {
    let topic = |i: usize| log.topics.get(i).cloned();
    sqlx::query(
        "INSERT INTO logs (chain_id, block_hash, log_index, block_number, address,
                           topic0, topic1, topic2, topic3, data, tx_hash, tx_index)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
    conn: &mut sqlx::PgConnection,
    tx: &CachedTransaction,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO transactions (chain_id, hash, block_hash, tx_index, from_addr,
                                   to_addr, value, input, nonce)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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

async fn merge_interval_tx(
    conn: &mut sqlx::PgConnection,
    chain_id: u64,
    fingerprint: &SourceFingerprint,
    interval: BlockInterval,
) -> Result<(), CacheError> {
    let rows = sqlx::query(
        "SELECT from_block, to_block FROM intervals
         WHERE chain_id = $1 AND fingerprint = $2 FOR UPDATE",
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

    sqlx::query("DELETE FROM intervals WHERE chain_id = $1 AND fingerprint = $2")
        .bind(chain_id as i64)
        .bind(fingerprint.as_str())
        .execute(&mut *conn)
        .await?;

    for iv in set.as_slice() {
        sqlx::query(
            "INSERT INTO intervals (chain_id, fingerprint, from_block, to_block)
             VALUES ($1, $2, $3, $4)",
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
impl CacheStore for PostgresCache {
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
        let row = sqlx::query("SELECT 1 AS one FROM blocks WHERE chain_id = $1 AND hash = $2")
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
        Ok(())
    }

    async fn cached_intervals(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
    ) -> Result<IntervalSet, CacheError> {
        let rows = sqlx::query(
            "SELECT from_block, to_block FROM intervals
             WHERE chain_id = $1 AND fingerprint = $2 ORDER BY from_block",
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
        debug!(chain_id, %fingerprint, %interval, logs = logs.len(), "slice committed");
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
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3",
        );
        let mut next_param = 4usize;
        if !addresses.is_empty() {
            sql.push_str(&format!(
                " AND address = ANY(${next_param})"
            ));
            next_param += 1;
        }
        if !selectors.is_empty() {
            sql.push_str(&format!(" AND topic0 = ANY(${next_param})"));
        }
        sql.push_str(" ORDER BY block_number, log_index");

        let mut query = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(range.from as i64)
            .bind(range.to as i64);
        if !addresses.is_empty() {
            query = query.bind(addresses);
        }
        if !selectors.is_empty() {
            query = query.bind(selectors);
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
             FROM blocks WHERE chain_id = $1 AND hash = $2",
        )
        .bind(chain_id as i64)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CachedBlock {
            chain_id: r.get::<i64, _>("chain_id") as u64,
            hash: r.get("hash"),
            parent_hash: r.get("parent_hash"),
            number: r.get::<i64, _>("number") as u64,
            timestamp: r.get::<i64, _>("timestamp"),
            gas_used: r.get("gas_used"),
            miner: r.get("miner"),
        }))
    }

    async fn transaction_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<CachedTransaction>, CacheError> {
        let row = sqlx::query(
            "SELECT chain_id, hash, block_hash, tx_index, from_addr, to_addr, value, input, nonce
             FROM transactions WHERE chain_id = $1 AND hash = $2",
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

        sqlx::query("DELETE FROM logs WHERE chain_id = $1 AND block_number >= $2")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM transactions WHERE chain_id = $1 AND block_hash IN
             (SELECT hash FROM blocks WHERE chain_id = $1 AND number >= $2)",
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM blocks WHERE chain_id = $1 AND number >= $2")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM intervals WHERE chain_id = $1 AND from_block >= $2")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await?;

        if block_number > 0 {
            sqlx::query(
                "UPDATE intervals SET to_block = $1 WHERE chain_id = $2 AND to_block >= $3",
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
             FROM checkpoints WHERE chain_id = $1 AND source_name = $2",
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
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id, source_name) DO UPDATE SET
               block_number = EXCLUDED.block_number,
               log_index = EXCLUDED.log_index,
               updated_at = EXCLUDED.updated_at",
        )
        .bind(checkpoint.chain_id as i64)
        .bind(&checkpoint.source_name)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.log_index as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_checkpoint(&self, chain_id: u64, source_name: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = $1 AND source_name = $2")
            .bind(chain_id as i64)
            .bind(source_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
