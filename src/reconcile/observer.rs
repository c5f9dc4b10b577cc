//! Matching observer: drains equal pairs out of one partition's staging
//! relations while extraction is running, then promotes the residue to
//! findings.

use std::sync::Arc;

use tokio::time::Duration;

use super::gate::{Gate, GateSnapshot};
use crate::config::CompareConfig;
use crate::error::{ReconcileError, Result};
use crate::models::Side;
use crate::storage::{RepositoryStore, StagingPair};

/// Consecutive zero-match passes, with every producer finished, needed to leave `Running`.
const CONFIRMATION_PASSES: u32 = 2;
/// Consecutive failed passes before the observer gives up on the partition.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Running,
    Draining,
    Cleanup,
    Done,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub equal: u64,
    pub passes: u64,
    pub source_findings: u64,
    pub target_findings: u64,
}

pub struct MatchingObserver {
    pub tid: i64,
    pub cid: i64,
    pub partition: u32,
    pub table_name: String,
    pub batch_nbr: i64,
    pub pair: StagingPair,
    pub settings: CompareConfig,
    pub store: RepositoryStore,
    pub gate: Arc<Gate>,
}

impl MatchingObserver {
    fn producers_done(&self, gate: &GateSnapshot) -> bool {
        gate.both_complete()
            && (self.settings.loader_threads == 0
                || gate.loader_complete >= 2 * self.settings.loader_threads)
    }

    pub async fn run(self) -> Result<ObserverStats> {
        let sleep = Duration::from_millis(self.settings.observer_sleep_ms);
        let high_volume_sleep = Duration::from_millis(self.settings.observer_high_volume_sleep_ms);

        let mut state = ObserverState::Running;
        let mut stats = ObserverStats::default();
        let mut pending = 0u64;
        let mut confirmations = 0u32;
        let mut failures = 0u32;

        tracing::info!(table = %self.table_name, partition = self.partition, "Starting matching observer");

        loop {
            match state {
                ObserverState::Running => {
                    // Completion is judged on flags read before the pass, so every
                    // row committed by a finished producer is visible to it.
                    let before = self.gate.snapshot();

                    let matched = match self.store.clear_matches(&self.pair).await {
                        Ok(matched) => {
                            failures = 0;
                            matched
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::error!(
                                table = %self.table_name,
                                partition = self.partition,
                                "Matching pass failed ({}/{}): {}",
                                failures,
                                MAX_CONSECUTIVE_FAILURES,
                                e
                            );
                            if failures >= MAX_CONSECUTIVE_FAILURES {
                                self.gate.abort();
                                return Err(ReconcileError::ObserverAborted);
                            }
                            tokio::time::sleep(sleep).await;
                            continue;
                        }
                    };
                    stats.passes += 1;
                    stats.equal += matched;
                    pending += matched;

                    if matched > 0 {
                        tracing::debug!(partition = self.partition, "Matched {} rows", matched);
                        if stats.equal > self.settings.observer_high_volume_threshold {
                            tokio::time::sleep(high_volume_sleep).await;
                        }
                    } else {
                        let now = self.gate.snapshot();
                        if pending > 0 || now.either_complete() || now.both_waiting() {
                            // A failed publish keeps the delta for the next pass.
                            match self.store.add_equal(self.cid, pending).await {
                                Ok(()) => pending = 0,
                                Err(e) => tracing::error!(
                                    partition = self.partition,
                                    "Failed to publish equal count: {}",
                                    e
                                ),
                            }
                            self.gate.notify_all();

                            if self.settings.observer_vacuum {
                                if let Err(e) = self.store.vacuum().await {
                                    tracing::warn!("Vacuum failed: {}", e);
                                }
                            }
                        }
                        if !self.settings.database_sort && stats.equal == 0 {
                            self.gate.notify_all();
                        }
                        tokio::time::sleep(sleep).await;
                    }

                    if matched == 0 && self.producers_done(&before) {
                        confirmations += 1;
                        if confirmations >= CONFIRMATION_PASSES {
                            state = ObserverState::Draining;
                        }
                    } else {
                        confirmations = 0;
                    }
                }
                ObserverState::Draining => {
                    if pending > 0 {
                        self.store.add_equal(self.cid, pending).await?;
                        pending = 0;
                    }
                    state = ObserverState::Cleanup;
                }
                ObserverState::Cleanup => {
                    tracing::info!(table = %self.table_name, partition = self.partition, "Staging table cleanup");
                    stats.source_findings = self.promote(Side::Source).await?;
                    stats.target_findings = self.promote(Side::Target).await?;
                    state = ObserverState::Done;
                }
                ObserverState::Done => break,
            }
        }

        tracing::info!(
            table = %self.table_name,
            partition = self.partition,
            "Observer done: {} equal, {} source / {} target findings after {} passes",
            stats.equal,
            stats.source_findings,
            stats.target_findings,
            stats.passes
        );
        Ok(stats)
    }

    /// Move one side's residue into findings, then drop its staging relation.
    async fn promote(&self, side: Side) -> Result<u64> {
        let staging = self.pair.table(side);
        let moved = self
            .store
            .load_findings(
                side,
                self.tid,
                &self.table_name,
                staging,
                self.batch_nbr,
                self.partition,
            )
            .await?;
        self.store.drop_staging(staging).await?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StagedRow;
    use tempfile::TempDir;

    fn staged(pk: i64, hash: &str) -> StagedRow {
        StagedRow {
            pk_hash: format!("pk{}", pk),
            column_hash: hash.to_string(),
            pk: format!(r#"{{"id":{}}}"#, pk),
        }
    }

    fn fast_settings() -> CompareConfig {
        CompareConfig {
            observer_sleep_ms: 10,
            observer_high_volume_sleep_ms: 5,
            ..CompareConfig::default()
        }
    }

    async fn create_test_store() -> (RepositoryStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RepositoryStore::new(temp_dir.path().join("repo.db").to_str().unwrap())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        (store, temp_dir)
    }

    fn observer(store: &RepositoryStore, gate: &Arc<Gate>, cid: i64, pair: StagingPair) -> MatchingObserver {
        MatchingObserver {
            tid: 1,
            cid,
            partition: 0,
            table_name: "items".into(),
            batch_nbr: 1,
            pair,
            settings: fast_settings(),
            store: store.clone(),
            gate: gate.clone(),
        }
    }

    #[tokio::test]
    async fn test_observer_matches_then_promotes_residue() {
        let (store, _temp) = create_test_store().await;
        let cid = store.create_result("run", 1, "items").await.unwrap();
        let pair = StagingPair::new(1, 0);
        store.create_staging(&pair.source).await.unwrap();
        store.create_staging(&pair.target).await.unwrap();
        store
            .insert_staged(&pair.source, &[staged(1, "a"), staged(2, "b"), staged(3, "c")])
            .await
            .unwrap();
        store
            .insert_staged(&pair.target, &[staged(1, "a"), staged(2, "x"), staged(4, "d")])
            .await
            .unwrap();

        let gate = Arc::new(Gate::new());
        gate.mark_complete(Side::Source);
        gate.mark_complete(Side::Target);

        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            observer(&store, &gate, cid, pair.clone()).run(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(stats.equal, 1);
        assert_eq!((stats.source_findings, stats.target_findings), (2, 2));
        assert!(stats.passes >= CONFIRMATION_PASSES as u64);
        let (_, equal, _, _) = store.run_counts(cid).await.unwrap();
        assert_eq!(equal, 1);
        assert!(!store.staging_exists(&pair.source).await.unwrap());
        assert!(!store.staging_exists(&pair.target).await.unwrap());
    }

    #[tokio::test]
    async fn test_observer_waits_for_late_rows_before_finishing() {
        let (store, _temp) = create_test_store().await;
        let cid = store.create_result("run", 1, "items").await.unwrap();
        let pair = StagingPair::new(1, 0);
        store.create_staging(&pair.source).await.unwrap();
        store.create_staging(&pair.target).await.unwrap();

        let gate = Arc::new(Gate::new());
        let handle = tokio::spawn(observer(&store, &gate, cid, pair.clone()).run());

        // Rows arrive after the observer started; sides complete afterwards.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.insert_staged(&pair.source, &[staged(1, "a")]).await.unwrap();
        store.insert_staged(&pair.target, &[staged(1, "a")]).await.unwrap();
        gate.mark_complete(Side::Source);
        gate.mark_complete(Side::Target);

        let stats = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.equal, 1);
        assert_eq!(stats.source_findings + stats.target_findings, 0);
    }

    #[tokio::test]
    async fn test_observer_aborts_gate_after_repeated_failures() {
        let (store, _temp) = create_test_store().await;
        let cid = store.create_result("run", 1, "items").await.unwrap();
        // Staging relations never created: every pass fails.
        let gate = Arc::new(Gate::new());
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            observer(&store, &gate, cid, StagingPair::new(99, 0)).run(),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(ReconcileError::ObserverAborted)));
        assert!(gate.is_aborted());
    }
}
