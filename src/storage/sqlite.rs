use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::{Disposition, Finding, RunStatus, Side, StagedRow, Tally};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown run {0}")]
    UnknownRun(i64),
    #[error("Malformed stored key {0}")]
    Key(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Rows per multi-row INSERT; keeps bound parameters well under SQLite's limit.
const INSERT_CHUNK_ROWS: usize = 300;

/// Statements slower than this are counted and logged.
const SLOW_STATEMENT_MS: u64 = 1000;

/// Statement timing for the matching hot path.
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_statements: Arc<AtomicU64>,
    pub slow_statements: Arc<AtomicU64>,
    pub total_time_ms: Arc<AtomicU64>,
}

impl QueryMetrics {
    pub fn record(&self, what: &str, duration_ms: u64) {
        self.total_statements.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms.fetch_add(duration_ms, Ordering::Relaxed);

        if duration_ms > SLOW_STATEMENT_MS {
            self.slow_statements.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow statement ({}): {}ms", what, duration_ms);
        }
    }

    pub fn get_stats(&self) -> (u64, u64, u64) {
        (
            self.total_statements.load(Ordering::Relaxed),
            self.slow_statements.load(Ordering::Relaxed),
            self.total_time_ms.load(Ordering::Relaxed),
        )
    }
}

/// Names of one partition's staging relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPair {
    pub source: String,
    pub target: String,
}

impl StagingPair {
    pub fn new(tid: i64, partition: u32) -> Self {
        Self {
            source: staging_table_name(Side::Source, tid, partition),
            target: staging_table_name(Side::Target, tid, partition),
        }
    }

    pub fn table(&self, side: Side) -> &str {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }
}

pub fn staging_table_name(side: Side, tid: i64, partition: u32) -> String {
    format!("dc_stage_{}_{}_{}", side.as_str(), tid, partition)
}

/// Repository database: staging relations, findings and run records.
#[derive(Clone)]
pub struct RepositoryStore {
    pool: SqlitePool,
    metrics: QueryMetrics,
}

impl RepositoryStore {
    /// Open (creating if needed) the repository database at `db_path`.
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", db_path))?
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Extraction workers of every partition write concurrently.
            .busy_timeout(Duration::from_secs(60))
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(60))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            metrics: QueryMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        tracing::info!("Repository migrations completed");
        Ok(())
    }

    /// Quick connectivity check: runs SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // === Run records ===

    /// Insert a `processing` run record and return its compare id.
    pub async fn create_result(&self, rid: &str, tid: i64, table_name: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO dc_result (rid, tid, table_name, status)
            VALUES (?, ?, ?, 'processing')
            RETURNING cid
            "#,
        )
        .bind(rid)
        .bind(tid)
        .bind(table_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("cid"))
    }

    pub async fn add_equal(&self, cid: i64, count: u64) -> Result<()> {
        sqlx::query("UPDATE dc_result SET equal_cnt = equal_cnt + ? WHERE cid = ?")
            .bind(count as i64)
            .bind(cid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_row_count(&self, cid: i64, side: Side, count: u64) -> Result<()> {
        let sql = match side {
            Side::Source => "UPDATE dc_result SET source_cnt = source_cnt + ? WHERE cid = ?",
            Side::Target => "UPDATE dc_result SET target_cnt = target_cnt + ? WHERE cid = ?",
        };
        sqlx::query(sql)
            .bind(count as i64)
            .bind(cid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, cid: i64, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE dc_result SET status = ? WHERE cid = ?")
            .bind(status.as_str())
            .bind(cid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_skipped(&self, cid: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dc_result
            SET equal_cnt = 0, missing_source_cnt = 0, missing_target_cnt = 0,
                not_equal_cnt = 0, source_cnt = 0, target_cnt = 0, status = 'skipped'
            WHERE cid = ?
            "#,
        )
        .bind(cid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current `(status, equal, source_cnt, target_cnt)` of a run.
    pub async fn run_counts(&self, cid: i64) -> Result<(RunStatus, i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT status, equal_cnt, source_cnt, target_cnt FROM dc_result WHERE cid = ?",
        )
        .bind(cid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::UnknownRun(cid))?;

        let status: String = row.get("status");
        Ok((
            RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            row.get("equal_cnt"),
            row.get("source_cnt"),
            row.get("target_cnt"),
        ))
    }

    // === Staging relations ===

    /// Drop any leftover relation of the same name, then create it empty.
    pub async fn create_staging(&self, table: &str) -> Result<()> {
        self.drop_staging(table).await?;
        sqlx::query(&format!(
            "CREATE TABLE {} (pk_hash TEXT NOT NULL, column_hash TEXT NOT NULL, pk TEXT NOT NULL, matched INTEGER NOT NULL DEFAULT 0)",
            table
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX {0}_hash ON {0} (pk_hash, column_hash)",
            table
        ))
        .execute(&self.pool)
        .await?;

        tracing::debug!("Staging table created: {}", table);
        Ok(())
    }

    pub async fn drop_staging(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a batch of fingerprints to a staging relation in one transaction.
    pub async fn insert_staged(&self, table: &str, rows: &[StagedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {} (pk_hash, column_hash, pk) ", table));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.pk_hash.as_str())
                    .push_bind(row.column_hash.as_str())
                    .push_bind(row.pk.as_str());
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Anti-join delete: remove every row whose `(pk_hash, column_hash)` is
    /// present in both staging relations. Returns the number of source rows
    /// removed; a source row takes every equal target duplicate with it.
    ///
    /// Runs as a single write transaction, so concurrent batch inserts land
    /// either entirely before or entirely after a pass.
    pub async fn clear_matches(&self, pair: &StagingPair) -> Result<u64> {
        let start = Instant::now();
        let (s, t) = (&pair.source, &pair.target);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "UPDATE {s} SET matched = 1 WHERE matched = 0 AND EXISTS \
             (SELECT 1 FROM {t} WHERE {t}.pk_hash = {s}.pk_hash AND {t}.column_hash = {s}.column_hash)"
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {t} WHERE EXISTS \
             (SELECT 1 FROM {s} WHERE {s}.matched = 1 AND {s}.pk_hash = {t}.pk_hash AND {s}.column_hash = {t}.column_hash)"
        ))
        .execute(&mut *tx)
        .await?;

        let matched = sqlx::query(&format!("DELETE FROM {s} WHERE matched = 1"))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        self.metrics
            .record("clear_matches", start.elapsed().as_millis() as u64);
        Ok(matched)
    }

    /// Return freed pages to the file after heavy delete churn.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Findings ===

    /// Remove findings left over from a previous attempt of this table/batch.
    pub async fn clear_findings(&self, tid: i64, batch_nbr: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for side in [Side::Source, Side::Target] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE tid = ? AND batch_nbr = ?",
                side.finding_table()
            ))
            .bind(tid)
            .bind(batch_nbr)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Move every unmatched row of a staging relation into durable findings.
    pub async fn load_findings(
        &self,
        side: Side,
        tid: i64,
        table_name: &str,
        staging_table: &str,
        batch_nbr: i64,
        partition: u32,
    ) -> Result<u64> {
        let moved = sqlx::query(&format!(
            r#"
            INSERT INTO {} (tid, table_name, partition_id, batch_nbr, pk_hash, column_hash, pk, compare_result)
            SELECT ?, ?, ?, ?, pk_hash, column_hash, pk, NULL FROM {}
            "#,
            side.finding_table(),
            staging_table
        ))
        .bind(tid)
        .bind(table_name)
        .bind(partition as i64)
        .bind(batch_nbr)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(moved)
    }

    /// Tag the residual findings of one table batch and publish the final
    /// counts for `cid` in one transaction. Nothing is written if any step
    /// fails.
    pub async fn classify_findings(&self, tid: i64, batch_nbr: i64, cid: i64) -> Result<Tally> {
        let mut tx = self.pool.begin().await?;

        // Pairs that matched but landed in different partitions.
        sqlx::query(
            r#"
            UPDATE dc_source SET compare_result = 'e'
            WHERE tid = ? AND batch_nbr = ?
              AND EXISTS (SELECT 1 FROM dc_target t WHERE t.tid = dc_source.tid
                  AND t.batch_nbr = dc_source.batch_nbr AND t.pk_hash = dc_source.pk_hash
                  AND t.column_hash = dc_source.column_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM dc_target
            WHERE tid = ? AND batch_nbr = ?
              AND EXISTS (SELECT 1 FROM dc_source s WHERE s.tid = dc_target.tid
                  AND s.batch_nbr = dc_target.batch_nbr AND s.compare_result = 'e'
                  AND s.pk_hash = dc_target.pk_hash AND s.column_hash = dc_target.column_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?;
        let late_equal = sqlx::query(
            "DELETE FROM dc_source WHERE tid = ? AND batch_nbr = ? AND compare_result = 'e'",
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        let missing_source = sqlx::query(
            r#"
            UPDATE dc_target SET compare_result = 'm'
            WHERE tid = ? AND batch_nbr = ?
              AND NOT EXISTS (SELECT 1 FROM dc_source s WHERE s.tid = dc_target.tid
                  AND s.batch_nbr = dc_target.batch_nbr AND s.pk_hash = dc_target.pk_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        let missing_target = sqlx::query(
            r#"
            UPDATE dc_source SET compare_result = 'm'
            WHERE tid = ? AND batch_nbr = ?
              AND NOT EXISTS (SELECT 1 FROM dc_target t WHERE t.tid = dc_source.tid
                  AND t.batch_nbr = dc_source.batch_nbr AND t.pk_hash = dc_source.pk_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        let not_equal = sqlx::query(
            r#"
            UPDATE dc_source SET compare_result = 'n'
            WHERE tid = ? AND batch_nbr = ?
              AND EXISTS (SELECT 1 FROM dc_target t WHERE t.tid = dc_source.tid
                  AND t.batch_nbr = dc_source.batch_nbr AND t.pk_hash = dc_source.pk_hash
                  AND t.column_hash != dc_source.column_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        sqlx::query(
            r#"
            UPDATE dc_target SET compare_result = 'n'
            WHERE tid = ? AND batch_nbr = ?
              AND EXISTS (SELECT 1 FROM dc_source s WHERE s.tid = dc_target.tid
                  AND s.batch_nbr = dc_target.batch_nbr AND s.pk_hash = dc_target.pk_hash
                  AND s.column_hash != dc_target.column_hash)
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE dc_result SET equal_cnt = equal_cnt + ?
            WHERE cid = ?
            RETURNING equal_cnt
            "#,
        )
        .bind(late_equal)
        .bind(cid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::UnknownRun(cid))?;

        let tally = Tally {
            equal: row.get("equal_cnt"),
            not_equal,
            missing_source,
            missing_target,
        };

        sqlx::query(
            r#"
            UPDATE dc_result
            SET missing_source_cnt = ?, missing_target_cnt = ?, not_equal_cnt = ?, status = ?
            WHERE cid = ?
            "#,
        )
        .bind(tally.missing_source)
        .bind(tally.missing_target)
        .bind(tally.not_equal)
        .bind(tally.status().as_str())
        .bind(cid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tally)
    }

    /// Distinct out-of-sync findings of a table batch (both sides), up to `limit`.
    pub async fn out_of_sync_findings(
        &self,
        tid: i64,
        batch_nbr: i64,
        limit: i64,
    ) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            r#"
            SELECT pk_hash, pk, batch_nbr, MIN(code) AS code
            FROM (SELECT pk_hash, pk, batch_nbr, 's' || compare_result AS code
                  FROM dc_source
                  WHERE tid = ? AND batch_nbr = ? AND compare_result IS NOT NULL AND compare_result != 'e'
                  UNION ALL
                  SELECT pk_hash, pk, batch_nbr, 't' || compare_result AS code
                  FROM dc_target
                  WHERE tid = ? AND batch_nbr = ? AND compare_result IS NOT NULL AND compare_result != 'e')
            GROUP BY pk_hash, batch_nbr
            ORDER BY pk_hash
            LIMIT ?
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .bind(tid)
        .bind(batch_nbr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let code: String = row.get("code");
                let side = if code.starts_with('s') {
                    Side::Source
                } else {
                    Side::Target
                };
                Finding {
                    tid,
                    pk_hash: row.get("pk_hash"),
                    pk: row.get("pk"),
                    batch_nbr: row.get("batch_nbr"),
                    disposition: Disposition::from_code(side, &code[1..]),
                }
            })
            .collect())
    }

    pub async fn count_out_of_sync(&self, tid: i64, batch_nbr: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT pk_hash FROM dc_source
                WHERE tid = ? AND batch_nbr = ? AND compare_result IS NOT NULL AND compare_result != 'e'
                UNION
                SELECT pk_hash FROM dc_target
                WHERE tid = ? AND batch_nbr = ? AND compare_result IS NOT NULL AND compare_result != 'e')
            "#,
        )
        .bind(tid)
        .bind(batch_nbr)
        .bind(tid)
        .bind(batch_nbr)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Delete a resolved finding from both sides.
    pub async fn remove_finding(&self, tid: i64, pk_hash: &str, batch_nbr: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for side in [Side::Source, Side::Target] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE tid = ? AND pk_hash = ? AND batch_nbr = ?",
                side.finding_table()
            ))
            .bind(tid)
            .bind(pk_hash)
            .bind(batch_nbr)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rewrite the finding rows of one key so the next classification yields
    /// `disposition`. Missing rows keep only the side they exist on; a
    /// not-equal key gets a row on both sides with differing hashes.
    pub async fn set_disposition(
        &self,
        tid: i64,
        pk_hash: &str,
        batch_nbr: i64,
        disposition: Disposition,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let copy_missing = |to: Side| {
            format!(
                r#"
                INSERT INTO {to} (tid, table_name, partition_id, batch_nbr, pk_hash, column_hash, pk, compare_result)
                SELECT tid, table_name, partition_id, batch_nbr, pk_hash, 'recheck:' || column_hash, pk, compare_result
                FROM {from} o
                WHERE o.tid = ? AND o.pk_hash = ? AND o.batch_nbr = ?
                  AND NOT EXISTS (SELECT 1 FROM {to} p WHERE p.tid = o.tid AND p.pk_hash = o.pk_hash
                                  AND p.batch_nbr = o.batch_nbr)
                LIMIT 1
                "#,
                to = to.finding_table(),
                from = to.other().finding_table()
            )
        };

        let (keep, drop) = match disposition.present_side() {
            Some(present) => (vec![present], Some(present.other())),
            None => (vec![Side::Source, Side::Target], None),
        };

        for side in keep {
            sqlx::query(&copy_missing(side))
                .bind(tid)
                .bind(pk_hash)
                .bind(batch_nbr)
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "UPDATE {} SET compare_result = ? WHERE tid = ? AND pk_hash = ? AND batch_nbr = ?",
                side.finding_table()
            ))
            .bind(disposition.code())
            .bind(tid)
            .bind(pk_hash)
            .bind(batch_nbr)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(side) = drop {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE tid = ? AND pk_hash = ? AND batch_nbr = ?",
                side.finding_table()
            ))
            .bind(tid)
            .bind(pk_hash)
            .bind(batch_nbr)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Inspection helpers for assertions.
#[cfg(test)]
impl RepositoryStore {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn staging_exists(&self, table: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    pub async fn staging_count(&self, table: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn finding_count(&self, side: Side, tid: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE tid = ?",
            side.finding_table()
        ))
        .bind(tid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }
}
