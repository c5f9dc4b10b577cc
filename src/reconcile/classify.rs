//! Result classifier: turns a table's residual findings into the final
//! counts and status.

use crate::error::{ReconcileError, Result};
use crate::models::{RunStatus, TableSpec, Tally};
use crate::storage::RepositoryStore;

/// Tag every finding of `table` and publish counts and status for `cid`.
///
/// All tagging and the published counts commit together; on failure the run
/// is marked `failed` and nothing partial is visible.
pub async fn classify(store: &RepositoryStore, table: &TableSpec, cid: i64) -> Result<Tally> {
    match store.classify_findings(table.tid, table.batch_nbr, cid).await {
        Ok(tally) => {
            tracing::info!(
                table = %table.alias,
                "Classified: equal={} not_equal={} missing_source={} missing_target={} ({})",
                tally.equal,
                tally.not_equal,
                tally.missing_source,
                tally.missing_target,
                tally.status().as_str()
            );
            Ok(tally)
        }
        Err(e) => {
            tracing::error!(table = %table.alias, "Classification failed: {}", e);
            if let Err(mark) = store.set_status(cid, RunStatus::Failed).await {
                tracing::error!(table = %table.alias, "Cannot mark run {} failed: {}", cid, mark);
            }
            Err(ReconcileError::Classification(e))
        }
    }
}

/// Short-circuit a table without a usable primary key.
pub async fn skip(store: &RepositoryStore, table: &TableSpec, cid: i64) -> Result<()> {
    tracing::warn!(table = %table.alias, "No primary key on one side, table skipped");
    store.mark_skipped(cid).await?;
    Ok(())
}
