//! Extraction worker: streams one side's compare query for one partition,
//! fingerprints each row and stages it.

use std::sync::Arc;

use futures::StreamExt;
use tokio::time::{Duration, Instant};

use super::gate::Gate;
use super::loader::BatchQueue;
use crate::config::CompareConfig;
use crate::error::{ReconcileError, Result};
use crate::models::{HashMode, PrimaryKey, Side, StagedRow, TableSpec};
use crate::source::{RowSource, SourceRow};
use crate::storage::RepositoryStore;

/// Pause at a throttle point when the worker is not gated by the observer.
const UNGATED_PAUSE: Duration = Duration::from_secs(1);

/// Separates projected values before in-process hashing.
const VALUE_SEPARATOR: char = '\u{1f}';
/// Stands in for NULL so `(NULL, 'a')` and `('a', NULL)` hash differently.
const NULL_MARKER: char = '\u{0}';

/// The compare query for one side and partition, with the partition predicate
/// and primary-key ordering appended.
pub fn compare_query(
    table: &TableSpec,
    side: Side,
    source: &dyn RowSource,
    partition: u32,
    database_sort: bool,
) -> String {
    let map = table.side(side);
    let mut sql = map.compare_sql.trim_end().trim_end_matches(';').to_string();

    if table.parallel_degree > 1 {
        if let Some(column) = table.mod_column(side) {
            sql.push_str(&source.partition_predicate(column, table.parallel_degree, partition));
        }
    }

    if database_sort && map.metadata.has_primary_key() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&map.metadata.pk_columns.join(", "));
    }
    sql
}

fn hash_hex(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Canonical key JSON; tolerates the trailing comma some engines' JSON
/// builders leave behind.
fn normalize_key(pk: &str) -> Option<String> {
    PrimaryKey::parse(pk)
        .or_else(|_| PrimaryKey::parse(&pk.replace(",}", "}")))
        .ok()
        .filter(|key| !key.is_empty())
        .map(|key| key.to_json())
}

/// Turn one compare-query row into its staged fingerprint.
pub fn fingerprint(row: SourceRow, mode: HashMode) -> std::result::Result<StagedRow, String> {
    let pk = normalize_key(&row.pk).ok_or_else(|| format!("malformed key {}", row.pk))?;

    let (pk_hash, column_hash) = match mode {
        HashMode::Database => {
            let column_hash = row
                .values
                .into_iter()
                .next()
                .flatten()
                .ok_or_else(|| format!("missing column hash for key {}", pk))?;
            (row.pk_hash, column_hash)
        }
        HashMode::Application => {
            let mut joined = String::new();
            for (i, value) in row.values.iter().enumerate() {
                if i > 0 {
                    joined.push(VALUE_SEPARATOR);
                }
                match value {
                    Some(v) => joined.push_str(v),
                    None => joined.push(NULL_MARKER),
                }
            }
            (hash_hex(&row.pk_hash), hash_hex(&joined))
        }
    };

    Ok(StagedRow {
        pk_hash,
        column_hash,
        pk,
    })
}

pub struct ExtractionWorker {
    pub side: Side,
    pub partition: u32,
    pub cid: i64,
    pub table_name: String,
    pub sql: String,
    pub staging_table: String,
    pub hash_mode: HashMode,
    pub settings: CompareConfig,
    pub source: Arc<dyn RowSource>,
    pub store: RepositoryStore,
    pub gate: Arc<Gate>,
    pub queue: Option<Arc<BatchQueue>>,
}

/// Counters reported by a finished worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub rows: u64,
    pub skipped: u64,
}

impl ExtractionWorker {
    /// Extract to completion. The side is marked complete on the gate on
    /// every exit path so the observer and loaders never wait forever.
    pub async fn run(self) -> Result<ExtractStats> {
        let start = Instant::now();
        tracing::info!(
            table = %self.table_name,
            side = %self.side,
            partition = self.partition,
            "Starting extraction"
        );

        let result = self.extract().await;

        if let Some(queue) = &self.queue {
            if !queue.is_empty() {
                tracing::info!(side = %self.side, partition = self.partition, "Waiting for batch queue to drain");
            }
            queue.drained().await;
        }
        self.gate.mark_complete(self.side);

        match &result {
            Ok(stats) => tracing::info!(
                table = %self.table_name,
                side = %self.side,
                partition = self.partition,
                "Complete. Total rows loaded: {} ({} skipped) in {:.1}s",
                stats.rows,
                stats.skipped,
                start.elapsed().as_secs_f64()
            ),
            Err(e) => tracing::error!(
                table = %self.table_name,
                side = %self.side,
                partition = self.partition,
                "Extraction failed: {}",
                e
            ),
        }
        result
    }

    async fn extract(&self) -> Result<ExtractStats> {
        let commit_size = self.settings.batch_commit_size.max(1);
        let progress_every = self.settings.batch_progress_report_size.max(1);

        let mut stats = ExtractStats::default();
        let mut unreported = 0u64;
        let mut first_pass = true;
        let mut batch: Vec<StagedRow> = Vec::with_capacity(commit_size);

        let mut rows = self.source.stream(&self.sql);
        while let Some(row) = rows.next().await {
            let row = match row {
                Ok(row) => row,
                Err(e) if e.is_row_local() => {
                    tracing::warn!(side = %self.side, partition = self.partition, "Skipping row: {}", e);
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match fingerprint(row, self.hash_mode) {
                Ok(staged) => batch.push(staged),
                Err(reason) => {
                    tracing::warn!(side = %self.side, partition = self.partition, "Skipping row: {}", reason);
                    stats.skipped += 1;
                    continue;
                }
            }
            stats.rows += 1;
            unreported += 1;

            if batch.len() >= commit_size {
                self.flush(&mut batch).await?;
            }

            if stats.rows % progress_every == 0 {
                tracing::info!(side = %self.side, partition = self.partition, "Loaded {} rows", stats.rows);
            }

            let throttle_every = if first_pass {
                self.settings.observer_first_pass_size
            } else {
                self.settings.observer_throttle_size
            }
            .max(1);
            if stats.rows % throttle_every == 0 {
                self.flush(&mut batch).await?;
                self.store
                    .add_row_count(self.cid, self.side, unreported)
                    .await?;
                unreported = 0;
                self.throttle(first_pass).await?;
                first_pass = false;
            }
        }
        drop(rows);

        self.flush(&mut batch).await?;
        self.store
            .add_row_count(self.cid, self.side, unreported)
            .await?;
        Ok(stats)
    }

    async fn throttle(&self, first_pass: bool) -> Result<()> {
        if first_pass || self.settings.observer_throttle {
            tracing::debug!(side = %self.side, partition = self.partition, "Wait for observer");
            self.gate.wait(self.side).await;
            if self.gate.is_aborted() {
                return Err(ReconcileError::ObserverAborted);
            }
            tracing::debug!(side = %self.side, partition = self.partition, "Cleared by observer");
        } else {
            tokio::time::sleep(UNGATED_PAUSE).await;
        }
        Ok(())
    }

    async fn flush(&self, batch: &mut Vec<StagedRow>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        match &self.queue {
            Some(queue) => queue.push(std::mem::take(batch)).await,
            None => {
                self.store.insert_staged(&self.staging_table, batch).await?;
                batch.clear();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnMap, ColumnMetadata, SideMap};
    use crate::source::SqliteRowSource;
    use crate::storage::StagingPair;
    use tempfile::TempDir;

    fn raw_row(pk: &str, values: &[Option<&str>]) -> SourceRow {
        SourceRow {
            pk_hash: pk.to_string(),
            pk: format!(r#"{{"id":{}}}"#, pk),
            values: values.iter().map(|v| v.map(str::to_string)).collect(),
        }
    }

    fn table(parallel_degree: u32, mod_column: Option<&str>) -> TableSpec {
        let side = SideMap {
            schema: String::new(),
            table: "items".into(),
            schema_preserve_case: false,
            table_preserve_case: false,
            mod_column: mod_column.map(str::to_string),
            compare_sql: "SELECT CAST(id AS TEXT), json_object('id', id), name FROM items WHERE 1=1;"
                .into(),
            check_sql: None,
            metadata: ColumnMetadata {
                pk_columns: vec!["id".into()],
                columns: vec!["name".into()],
            },
        };
        TableSpec {
            tid: 1,
            alias: "items".into(),
            batch_nbr: 1,
            parallel_degree,
            enabled: true,
            source: side.clone(),
            target: side,
            columns_map: ColumnMap::default(),
        }
    }

    #[test]
    fn test_application_hash_distinguishes_null_placement() {
        let a = fingerprint(raw_row("1", &[None, Some("a")]), HashMode::Application).unwrap();
        let b = fingerprint(raw_row("1", &[Some("a"), None]), HashMode::Application).unwrap();
        let c = fingerprint(raw_row("1", &[None, Some("a")]), HashMode::Application).unwrap();
        assert_ne!(a.column_hash, b.column_hash);
        assert_eq!(a, c);
        assert_eq!(a.pk_hash.len(), 64);
    }

    #[test]
    fn test_database_hash_takes_query_values() {
        let row = raw_row("7", &[Some("abc")]);
        let staged = fingerprint(row, HashMode::Database).unwrap();
        assert_eq!(staged.pk_hash, "7");
        assert_eq!(staged.column_hash, "abc");
        assert!(fingerprint(raw_row("7", &[None]), HashMode::Database).is_err());
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(normalize_key(r#"{"id":1,}"#).as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(normalize_key(r#"{ "id" : 1 }"#).as_deref(), Some(r#"{"id":1}"#));
        assert!(normalize_key("{}").is_none());
        assert!(normalize_key("not json").is_none());
    }

    #[tokio::test]
    async fn test_compare_query_adds_partition_and_order() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp.path().join("s.db").display());
        let source = SqliteRowSource::connect(&url).await.unwrap();

        let sql = compare_query(&table(2, Some("id")), Side::Target, &source, 1, true);
        assert!(sql.ends_with("WHERE 1=1 AND (id % 2) = 1 ORDER BY id"));

        let sql = compare_query(&table(1, Some("id")), Side::Source, &source, 0, false);
        assert!(sql.ends_with("WHERE 1=1"));
    }

    #[tokio::test]
    async fn test_worker_stages_rows_and_waits_at_throttle_points() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp.path().join("s.db").display());
        let source = SqliteRowSource::connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(source.pool())
            .await
            .unwrap();
        for i in 1..=7 {
            sqlx::query("INSERT INTO items VALUES (?, ?)")
                .bind(i)
                .bind(format!("n{}", i))
                .execute(source.pool())
                .await
                .unwrap();
        }
        // One malformed key is skipped, not fatal.
        sqlx::query("CREATE VIEW bad AS SELECT '8' AS id, 'oops' AS name")
            .execute(source.pool())
            .await
            .unwrap();

        let store = RepositoryStore::new(temp.path().join("repo.db").to_str().unwrap())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let cid = store.create_result("run", 1, "items").await.unwrap();
        let pair = StagingPair::new(1, 0);
        store.create_staging(&pair.source).await.unwrap();

        let settings = CompareConfig {
            batch_commit_size: 2,
            observer_first_pass_size: 3,
            observer_throttle_size: 2,
            ..CompareConfig::default()
        };
        let gate = Arc::new(Gate::new());
        let worker = ExtractionWorker {
            side: Side::Source,
            partition: 0,
            cid,
            table_name: "items".into(),
            sql: "SELECT CAST(id AS TEXT), json_object('id', id), name FROM items \
                  UNION ALL SELECT id, 'broken', name FROM bad ORDER BY 1"
                .into(),
            staging_table: pair.source.clone(),
            hash_mode: HashMode::Application,
            settings,
            source: Arc::new(source),
            store: store.clone(),
            gate: gate.clone(),
            queue: None,
        };

        // Stand-in observer: keep releasing the worker until it completes.
        let notifier = {
            let gate = gate.clone();
            tokio::spawn(async move {
                while !gate.snapshot().source_complete {
                    gate.notify_all();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let stats = tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap()
            .unwrap();
        notifier.await.unwrap();

        assert_eq!(stats, ExtractStats { rows: 7, skipped: 1 });
        assert_eq!(store.staging_count(&pair.source).await.unwrap(), 7);
        let (_, _, source_cnt, _) = store.run_counts(cid).await.unwrap();
        assert_eq!(source_cnt, 7);
        assert!(gate.snapshot().source_complete);
    }
}
