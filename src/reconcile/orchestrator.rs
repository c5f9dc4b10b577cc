//! Wires partitions together for one table and drives a whole run.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::check::RowValidator;
use super::classify;
use super::extract::{compare_query, ExtractionWorker};
use super::gate::Gate;
use super::loader::{BatchQueue, Loader};
use super::observer::MatchingObserver;
use crate::config::CompareConfig;
use crate::error::{ReconcileError, Result};
use crate::models::{HashMode, ReconcileResult, RunStatus, Side, TableSpec};
use crate::source::RowSource;
use crate::storage::{RepositoryStore, StagingPair};

/// Handles of every task spawned for one table. Owned by the caller; there
/// is no process-wide registry.
#[derive(Default)]
pub struct RunContext {
    handles: Vec<(String, JoinHandle<Result<()>>)>,
    errors: Vec<ReconcileError>,
}

impl RunContext {
    pub fn spawn<F>(&mut self, name: String, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.push((name, tokio::spawn(task)));
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every task; returns the failures, if any.
    pub async fn join(mut self) -> Vec<ReconcileError> {
        for (name, handle) in std::mem::take(&mut self.handles) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.errors.push(ReconcileError::worker(name, e)),
                Err(e) => self.errors.push(ReconcileError::worker(name, e.into())),
            }
        }
        self.errors
    }
}

/// Final summary of one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub rid: String,
    pub results: Vec<ReconcileResult>,
    /// Seconds.
    pub elapsed_time: u64,
}

pub struct Reconciler {
    store: RepositoryStore,
    source: Arc<dyn RowSource>,
    target: Arc<dyn RowSource>,
    settings: CompareConfig,
    fix_quote: char,
}

impl Reconciler {
    pub fn new(
        store: RepositoryStore,
        source: Arc<dyn RowSource>,
        target: Arc<dyn RowSource>,
        settings: CompareConfig,
    ) -> Self {
        let fix_quote = target.quote_char();
        Self {
            store,
            source,
            target,
            settings,
            fix_quote,
        }
    }

    pub fn with_fix_quote(mut self, quote: char) -> Self {
        self.fix_quote = quote;
        self
    }

    fn row_source(&self, side: Side) -> Arc<dyn RowSource> {
        match side {
            Side::Source => self.source.clone(),
            Side::Target => self.target.clone(),
        }
    }

    /// Reasons a table cannot be extracted as configured.
    fn preflight(&self, table: &TableSpec) -> Option<String> {
        if table.parallel_degree > 1 && table.mod_column(Side::Source).is_none() {
            return Some(format!(
                "parallel_degree {} requires a mod_column",
                table.parallel_degree
            ));
        }
        if table.columns_map.is_empty() {
            return Some("no column mapping".to_string());
        }
        None
    }

    /// Create staging and spawn every task of every partition. The returned
    /// context must be joined before classifying.
    pub async fn spawn_table(&self, table: &TableSpec, cid: i64) -> RunContext {
        let mut ctx = RunContext::default();
        for partition in 0..table.parallel_degree.max(1) {
            if let Err(e) = self.spawn_partition(&mut ctx, table, cid, partition).await {
                tracing::error!(table = %table.alias, partition, "Cannot start partition: {}", e);
                ctx.errors.push(e);
            }
        }
        tracing::info!(table = %table.alias, "Spawned {} tasks", ctx.task_count());
        ctx
    }

    async fn spawn_partition(
        &self,
        ctx: &mut RunContext,
        table: &TableSpec,
        cid: i64,
        partition: u32,
    ) -> Result<()> {
        let pair = StagingPair::new(table.tid, partition);
        self.store.create_staging(&pair.source).await?;
        self.store.create_staging(&pair.target).await?;

        let gate = Arc::new(Gate::new());
        let loader_threads = self.settings.loader_threads;

        for side in [Side::Source, Side::Target] {
            let queue = (loader_threads > 0).then(|| {
                Arc::new(BatchQueue::new(
                    self.settings.queue_capacity(),
                    self.settings.low_water(),
                    loader_threads,
                ))
            });

            if let Some(queue) = &queue {
                for id in 0..loader_threads {
                    let loader = Loader {
                        id,
                        side,
                        partition,
                        staging_table: pair.table(side).to_string(),
                        queue: queue.clone(),
                        gate: gate.clone(),
                        store: self.store.clone(),
                    };
                    ctx.spawn(
                        format!("loader {}/{}/{}", side, partition, id),
                        async move { loader.run().await.map(|_| ()) },
                    );
                }
            }

            let source = self.row_source(side);
            let sql = compare_query(
                table,
                side,
                source.as_ref(),
                partition,
                self.settings.database_sort,
            );
            tracing::debug!(table = %table.alias, side = %side, partition, "Compare query: {}", sql);

            let worker = ExtractionWorker {
                side,
                partition,
                cid,
                table_name: table.alias.clone(),
                sql,
                staging_table: pair.table(side).to_string(),
                hash_mode: self.settings.column_hash_method,
                settings: self.settings.clone(),
                source,
                store: self.store.clone(),
                gate: gate.clone(),
                queue,
            };
            ctx.spawn(format!("extract {}/{}", side, partition), async move {
                worker.run().await.map(|_| ())
            });
        }

        let observer = MatchingObserver {
            tid: table.tid,
            cid,
            partition,
            table_name: table.alias.clone(),
            batch_nbr: table.batch_nbr,
            pair,
            settings: self.settings.clone(),
            store: self.store.clone(),
            gate,
        };
        ctx.spawn(format!("observer {}", partition), async move {
            observer.run().await.map(|_| ())
        });
        Ok(())
    }

    async fn fail(&self, result: &mut ReconcileResult, cid: i64, reason: &str) {
        tracing::error!(table = %result.table_name, "Reconciliation failed: {}", reason);
        if let Err(e) = self.store.set_status(cid, RunStatus::Failed).await {
            tracing::error!(table = %result.table_name, "Cannot mark run {} failed: {}", cid, e);
        }
        result.status = RunStatus::Failed;
    }

    /// Reconcile one table end to end. Always returns a result record;
    /// failures are reported through its status.
    pub async fn reconcile_table(&self, rid: &str, table: &TableSpec) -> ReconcileResult {
        let start = Instant::now();
        let mut result = ReconcileResult::new(&table.alias);

        let cid = match self.store.create_result(rid, table.tid, &table.alias).await {
            Ok(cid) => cid,
            Err(e) => {
                tracing::error!(table = %table.alias, "Cannot create run record: {}", e);
                result.status = RunStatus::Failed;
                return result;
            }
        };
        result.cid = Some(cid);
        tracing::info!(table = %table.alias, cid, "Starting reconciliation");

        if !table.has_primary_key() {
            result.status = match classify::skip(&self.store, table, cid).await {
                Ok(()) => RunStatus::Skipped,
                Err(_) => RunStatus::Failed,
            };
            return result;
        }

        if let Some(reason) = self.preflight(table) {
            self.fail(&mut result, cid, &reason).await;
            return result;
        }

        if let Err(e) = self.store.clear_findings(table.tid, table.batch_nbr).await {
            self.fail(&mut result, cid, &e.to_string()).await;
            return result;
        }

        let errors = self.spawn_table(table, cid).await.join().await;
        if !errors.is_empty() {
            for e in &errors {
                tracing::error!(table = %table.alias, category = e.category().as_str(), "{}", e);
            }
            self.fail(&mut result, cid, &format!("{} task(s) failed", errors.len()))
                .await;
            result.set_elapsed(start.elapsed());
            return result;
        }

        match classify::classify(&self.store, table, cid).await {
            Ok(tally) => {
                result.apply_tally(&tally);
                result.status = tally.status();
            }
            Err(_) => result.status = RunStatus::Failed,
        }
        result.set_elapsed(start.elapsed());

        let (source_rows, target_rows) = match self.store.run_counts(cid).await {
            Ok((_, _, source_rows, target_rows)) => (source_rows, target_rows),
            Err(e) => {
                tracing::warn!(table = %table.alias, "Cannot read row counts: {}", e);
                (0, 0)
            }
        };
        tracing::info!(
            table = %table.alias,
            source_rows,
            target_rows,
            "Reconciliation complete: {} ({} rows, {} rows/s)",
            result.status.as_str(),
            result.total_rows,
            result.rows_per_second
        );
        result
    }

    /// Re-examine recorded findings of one table, optionally producing fixes.
    pub async fn check_table(&self, rid: &str, table: &TableSpec, fix: bool) -> ReconcileResult {
        let start = Instant::now();
        let mut result = ReconcileResult::new(&table.alias);

        let cid = match self.store.create_result(rid, table.tid, &table.alias).await {
            Ok(cid) => cid,
            Err(e) => {
                tracing::error!(table = %table.alias, "Cannot create run record: {}", e);
                result.status = RunStatus::Failed;
                return result;
            }
        };
        result.cid = Some(cid);

        if !table.has_primary_key() {
            result.status = match classify::skip(&self.store, table, cid).await {
                Ok(()) => RunStatus::Skipped,
                Err(_) => RunStatus::Failed,
            };
            return result;
        }

        if self.settings.column_hash_method == HashMode::Database
            && (table.source.check_sql.is_none() || table.target.check_sql.is_none())
        {
            tracing::warn!(
                table = %table.alias,
                "No check_sql with database hashing: comparing column hashes, INSERT/UPDATE fixes are omitted"
            );
        }

        let validator = RowValidator {
            table,
            source: self.source.as_ref(),
            target: self.target.as_ref(),
            store: &self.store,
            cid,
            max_rows: self.settings.max_check_rows,
            fix_quote: fix.then_some(self.fix_quote),
        };

        match validator.run().await {
            Ok((report, tally)) => {
                result.apply_tally(&tally);
                result.status = tally.status();
                result.check = Some(report);
            }
            Err(e) => self.fail(&mut result, cid, &e.to_string()).await,
        }
        result.set_elapsed(start.elapsed());
        result
    }

    fn selected<'t>(tables: &'t [TableSpec], only: Option<&'t str>) -> impl Iterator<Item = &'t TableSpec> {
        tables.iter().filter(move |t| {
            t.enabled && only.map_or(true, |alias| t.alias.eq_ignore_ascii_case(alias))
        })
    }

    /// Reconcile every enabled table (or just `only`), one after another.
    pub async fn reconcile_all(&self, tables: &[TableSpec], only: Option<&str>) -> RunSummary {
        let start = Instant::now();
        let rid = uuid::Uuid::new_v4().to_string();
        tracing::info!(rid = %rid, "Starting reconciliation run");

        let mut results = Vec::new();
        for table in Self::selected(tables, only) {
            results.push(self.reconcile_table(&rid, table).await);
        }

        let (statements, slow, total_ms) = self.store.metrics().get_stats();
        tracing::debug!(
            rid = %rid,
            "Match passes: {} ({} slow, {}ms total)",
            statements,
            slow,
            total_ms
        );

        RunSummary {
            rid,
            results,
            elapsed_time: start.elapsed().as_secs(),
        }
    }

    pub async fn check_all(&self, tables: &[TableSpec], only: Option<&str>, fix: bool) -> RunSummary {
        let start = Instant::now();
        let rid = uuid::Uuid::new_v4().to_string();
        tracing::info!(rid = %rid, fix, "Starting check run");

        let mut results = Vec::new();
        for table in Self::selected(tables, only) {
            results.push(self.check_table(&rid, table, fix).await);
        }

        RunSummary {
            rid,
            results,
            elapsed_time: start.elapsed().as_secs(),
        }
    }
}
