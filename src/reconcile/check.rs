//! Row-level validator: re-fetches flagged rows from both sides, compares
//! them cell by cell and optionally synthesizes fixes.

use super::classify;
use super::fix::{side_column, FixGenerator};
use crate::error::Result;
use crate::models::{
    CheckFinding, CheckReport, ColumnDiff, CompareResult, Disposition, Finding, PrimaryKey,
    RunStatus, Side, TableSpec, Tally,
};
use crate::source::{FetchedRow, RowSource};
use crate::storage::{RepositoryStore, StorageError};

/// Leading columns of a compare/check query that are not data columns.
const KEY_COLUMNS: usize = 2;

pub struct RowValidator<'a> {
    pub table: &'a TableSpec,
    pub source: &'a dyn RowSource,
    pub target: &'a dyn RowSource,
    pub store: &'a RepositoryStore,
    pub cid: i64,
    pub max_rows: i64,
    /// Quote character for fix statements; `None` disables fix generation.
    pub fix_quote: Option<char>,
}

/// Cell-by-cell comparison of the data columns, as text.
pub fn compare_rows(source: &FetchedRow, target: &FetchedRow) -> Vec<ColumnDiff> {
    let width = source.len().max(target.len());
    (KEY_COLUMNS..width)
        .filter_map(|i| {
            let source_cell = source.get(i);
            let target_cell = target.get(i);
            let source_value = source_cell.and_then(|(_, v)| v.as_text());
            let target_value = target_cell.and_then(|(_, v)| v.as_text());
            if source_value == target_value {
                return None;
            }
            let column = source_cell
                .or(target_cell)
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            Some(ColumnDiff {
                column,
                source_value,
                target_value,
            })
        })
        .collect()
}

impl<'a> RowValidator<'a> {
    fn row_source(&self, side: Side) -> &'a dyn RowSource {
        match side {
            Side::Source => self.source,
            Side::Target => self.target,
        }
    }

    /// Check query of one side restricted to a single key.
    fn keyed_query(&self, side: Side, key: &PrimaryKey) -> String {
        let source = self.row_source(side);
        let mut sql = self
            .table
            .side(side)
            .check_sql()
            .trim_end()
            .trim_end_matches(';')
            .to_string();
        for (column, _) in key.iter() {
            let column = side_column(self.table, side, column, source.quote_char());
            sql.push_str(&source.key_predicate(&column));
        }
        sql
    }

    async fn fetch_one(&self, side: Side, key: &PrimaryKey) -> Result<Option<FetchedRow>> {
        let sql = self.keyed_query(side, key);
        let binds: Vec<_> = key.iter().map(|(_, v)| v.clone()).collect();
        let rows = self.row_source(side).fetch(&sql, &binds).await?;
        self.store
            .add_row_count(self.cid, side, rows.len() as u64)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn check_one(&self, finding: &Finding) -> Result<CheckFinding> {
        let key = PrimaryKey::parse(&finding.pk)
            .map_err(|e| StorageError::Key(format!("{}: {}", finding.pk, e)))?;

        let source_row = self.fetch_one(Side::Source, &key).await?;
        let target_row = self.fetch_one(Side::Target, &key).await?;

        let result = match (&source_row, &target_row) {
            (Some(_), None) => CompareResult::MissingTarget,
            (None, Some(_)) => CompareResult::MissingSource,
            // Gone from both sides since extraction: nothing left to repair.
            (None, None) => CompareResult::InSync,
            (Some(s), Some(t)) => {
                let diffs = compare_rows(s, t);
                if diffs.is_empty() {
                    CompareResult::InSync
                } else {
                    CompareResult::NotEqual(diffs)
                }
            }
        };

        let disposition = match &result {
            CompareResult::InSync => None,
            CompareResult::MissingSource => Some(Disposition::MissingSource),
            CompareResult::MissingTarget => Some(Disposition::MissingTarget),
            CompareResult::NotEqual(_) => Some(Disposition::NotEqual),
        };

        let mut fix_sql = None;
        match disposition {
            None => {
                self.store
                    .remove_finding(self.table.tid, &finding.pk_hash, finding.batch_nbr)
                    .await?;
                self.store.add_equal(self.cid, 1).await?;
            }
            Some(disposition) => {
                tracing::warn!(table = %self.table.alias, "Out-of-sync: {} ({})", key, disposition);
                self.store
                    .set_disposition(self.table.tid, &finding.pk_hash, finding.batch_nbr, disposition)
                    .await?;

                if let Some(quote) = self.fix_quote {
                    let fixer = FixGenerator::new(self.table, quote);
                    let fix = match (disposition, source_row.as_ref()) {
                        (Disposition::MissingSource, _) => Ok(Some(fixer.delete(&key))),
                        (Disposition::MissingTarget, Some(row)) => fixer.insert(&key, row).map(Some),
                        (Disposition::NotEqual, Some(row)) => fixer.update(&key, row).map(Some),
                        _ => Ok(None),
                    };
                    match fix {
                        Ok(fix) => fix_sql = fix.map(|f| f.sql_text),
                        Err(e) => tracing::warn!(
                            table = %self.table.alias,
                            category = e.category().as_str(),
                            "Fix omitted for {}: {}",
                            key,
                            e
                        ),
                    }
                }
            }
        }

        Ok(CheckFinding {
            primary_key: key.to_json(),
            compare_status: if result.is_in_sync() {
                RunStatus::InSync
            } else {
                RunStatus::OutOfSync
            },
            compare_result: result,
            fix_sql,
        })
    }

    /// Re-examine up to `max_rows` findings, then re-classify the table.
    pub async fn run(&self) -> Result<(CheckReport, Tally)> {
        let (tid, batch_nbr) = (self.table.tid, self.table.batch_nbr);
        let total = self.store.count_out_of_sync(tid, batch_nbr).await?;
        let findings = self
            .store
            .out_of_sync_findings(tid, batch_nbr, self.max_rows)
            .await?;

        let mut report = CheckReport {
            unchecked: total - findings.len() as i64,
            ..CheckReport::default()
        };
        if report.unchecked > 0 {
            tracing::warn!(
                table = %self.table.alias,
                "Checking {} of {} out-of-sync rows (max_check_rows)",
                findings.len(),
                total
            );
        }

        for finding in &findings {
            match self.check_one(finding).await {
                Ok(checked) => {
                    if let Some(sql) = &checked.fix_sql {
                        report.fix_sql.push(sql.clone());
                    }
                    report.findings.push(checked);
                }
                Err(e) => {
                    tracing::error!(
                        table = %self.table.alias,
                        category = e.category().as_str(),
                        "Check of {} failed: {}",
                        finding.pk,
                        e
                    );
                }
            }
        }
        report.fix_count = report.fix_sql.len();

        tracing::info!(
            table = %self.table.alias,
            "Processed {} out-of-sync rows, {} fixes",
            report.findings.len(),
            report.fix_count
        );

        let tally = classify::classify(self.store, self.table, self.cid).await?;
        Ok((report, tally))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    fn row(values: &[Value]) -> FetchedRow {
        let mut row: FetchedRow = vec![
            ("pk_hash".into(), Value::from("1")),
            ("pk".into(), Value::from(r#"{"id":1}"#)),
        ];
        for (i, v) in values.iter().enumerate() {
            row.push((format!("c{}", i), v.clone()));
        }
        row
    }

    #[test]
    fn test_compare_rows_as_text() {
        let source = row(&[Value::from(5), Value::from("a"), Value::Null]);
        let target = row(&[Value::from("5"), Value::from("b"), Value::Null]);
        let diffs = compare_rows(&source, &target);

        assert_eq!(
            diffs,
            vec![ColumnDiff {
                column: "c1".into(),
                source_value: Some("a".into()),
                target_value: Some("b".into()),
            }]
        );
    }

    #[test]
    fn test_compare_rows_null_differs_from_empty() {
        let diffs = compare_rows(&row(&[Value::Null]), &row(&[Value::from("")]));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].source_value, None);
    }
}
