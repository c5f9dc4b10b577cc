use serde::{Deserialize, Serialize};

/// Lifecycle of one table's reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Processing,
    InSync,
    OutOfSync,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Processing => "processing",
            RunStatus::InSync => "in-sync",
            RunStatus::OutOfSync => "out-of-sync",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(RunStatus::Processing),
            "in-sync" => Some(RunStatus::InSync),
            "out-of-sync" => Some(RunStatus::OutOfSync),
            "skipped" => Some(RunStatus::Skipped),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Residual counts produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub equal: i64,
    pub not_equal: i64,
    pub missing_source: i64,
    pub missing_target: i64,
}

impl Tally {
    pub fn total(&self) -> i64 {
        self.equal + self.not_equal + self.missing_source + self.missing_target
    }

    pub fn out_of_sync(&self) -> i64 {
        self.not_equal + self.missing_source + self.missing_target
    }

    pub fn status(&self) -> RunStatus {
        if self.out_of_sync() == 0 {
            RunStatus::InSync
        } else {
            RunStatus::OutOfSync
        }
    }
}

/// One differing cell found by the row-level validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDiff {
    pub column: String,
    pub source_value: Option<String>,
    pub target_value: Option<String>,
}

/// Verified outcome of re-examining one finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "columns", rename_all = "kebab-case")]
pub enum CompareResult {
    InSync,
    MissingSource,
    MissingTarget,
    NotEqual(Vec<ColumnDiff>),
}

impl CompareResult {
    pub fn is_in_sync(&self) -> bool {
        matches!(self, CompareResult::InSync)
    }
}

/// Row-level check output for one finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFinding {
    pub primary_key: String,
    pub compare_status: RunStatus,
    pub compare_result: CompareResult,
    #[serde(rename = "fixSQL", skip_serializing_if = "Option::is_none")]
    pub fix_sql: Option<String>,
}

/// A synthesized repair statement for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixStatement {
    pub primary_key: String,
    pub sql_text: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub findings: Vec<CheckFinding>,
    #[serde(rename = "fixSQL")]
    pub fix_sql: Vec<String>,
    pub fix_count: usize,
    /// Findings beyond the configured check limit that were not examined.
    pub unchecked: i64,
}

/// Result record for one table, handed to reporting verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub table_name: String,
    pub cid: Option<i64>,
    pub status: RunStatus,
    pub equal: i64,
    pub not_equal: i64,
    pub missing_source: i64,
    pub missing_target: i64,
    pub total_rows: i64,
    /// Seconds.
    pub elapsed_time: u64,
    pub rows_per_second: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckReport>,
}

impl ReconcileResult {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            cid: None,
            status: RunStatus::Processing,
            equal: 0,
            not_equal: 0,
            missing_source: 0,
            missing_target: 0,
            total_rows: 0,
            elapsed_time: 0,
            rows_per_second: 0,
            check: None,
        }
    }

    pub fn apply_tally(&mut self, tally: &Tally) {
        self.equal = tally.equal;
        self.not_equal = tally.not_equal;
        self.missing_source = tally.missing_source;
        self.missing_target = tally.missing_target;
        self.total_rows = tally.total();
    }

    pub fn set_elapsed(&mut self, elapsed: std::time::Duration) {
        let secs = elapsed.as_secs();
        self.elapsed_time = secs;
        self.rows_per_second = if secs > 0 {
            self.total_rows / secs as i64
        } else {
            self.total_rows
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_status() {
        let mut t = Tally {
            equal: 10,
            ..Default::default()
        };
        assert_eq!(t.status(), RunStatus::InSync);
        t.missing_target = 1;
        assert_eq!(t.status(), RunStatus::OutOfSync);
        assert_eq!(t.total(), 11);
    }

    #[test]
    fn test_rows_per_second_without_elapsed_time() {
        let mut r = ReconcileResult::new("items");
        r.total_rows = 500;
        r.set_elapsed(std::time::Duration::from_millis(200));
        assert_eq!(r.rows_per_second, 500);
        r.set_elapsed(std::time::Duration::from_secs(5));
        assert_eq!(r.rows_per_second, 100);
    }

    #[test]
    fn test_result_serializes_in_camel_case() {
        let r = ReconcileResult::new("items");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["tableName"], "items");
        assert_eq!(json["status"], "processing");
        assert!(json.get("check").is_none());
    }
}
