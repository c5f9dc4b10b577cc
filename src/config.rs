use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::models::{HashMode, TableSpec};

/// rowrecon configuration from rowrecon.toml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RowreconConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub source: SideConfig,
    #[serde(default)]
    pub target: SideConfig,
    #[serde(default)]
    pub compare: CompareConfig,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_path")]
    pub path: String,
}

fn default_repository_path() -> String {
    ".rowrecon/repository.db".to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repository_path(),
        }
    }
}

/// Connection settings for one side.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SideConfig {
    /// SQLite URL, e.g. `sqlite:source.db`.
    #[serde(default)]
    pub url: String,
    /// Identifier quote character used in generated fix statements.
    #[serde(default)]
    pub quote_char: Option<char>,
}

/// Throughput and behaviour knobs of the compare pipeline.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CompareConfig {
    /// Rows per staging insert transaction.
    #[serde(default = "default_batch_commit_size")]
    pub batch_commit_size: usize,
    /// Rows between "Loaded N rows" progress lines.
    #[serde(default = "default_batch_progress_report_size")]
    pub batch_progress_report_size: u64,
    #[serde(default)]
    pub column_hash_method: HashMode,
    /// Append `ORDER BY <pk columns>` to compare queries.
    #[serde(default = "default_true")]
    pub database_sort: bool,
    /// Loader tasks per side per partition; 0 writes inline.
    #[serde(default)]
    pub loader_threads: usize,
    /// Capacity of the batch queue between an extraction worker and its loaders.
    #[serde(default = "default_message_queue_size")]
    pub message_queue_size: usize,
    /// In-flight batch count a blocked producer waits for before resuming.
    #[serde(default)]
    pub queue_low_water: Option<usize>,
    /// Pause workers at every throttle point, not only the first.
    #[serde(default = "default_true")]
    pub observer_throttle: bool,
    #[serde(default = "default_observer_throttle_size")]
    pub observer_throttle_size: u64,
    #[serde(default = "default_observer_first_pass_size")]
    pub observer_first_pass_size: u64,
    #[serde(default = "default_true")]
    pub observer_vacuum: bool,
    #[serde(default = "default_observer_sleep_ms")]
    pub observer_sleep_ms: u64,
    #[serde(default = "default_observer_high_volume_sleep_ms")]
    pub observer_high_volume_sleep_ms: u64,
    #[serde(default = "default_observer_high_volume_threshold")]
    pub observer_high_volume_threshold: u64,
    /// Findings examined per table in check mode.
    #[serde(default = "default_max_check_rows")]
    pub max_check_rows: i64,
}

fn default_true() -> bool {
    true
}

fn default_batch_commit_size() -> usize {
    2000
}

fn default_batch_progress_report_size() -> u64 {
    1_000_000
}

fn default_message_queue_size() -> usize {
    1000
}

fn default_observer_throttle_size() -> u64 {
    2_000_000
}

fn default_observer_first_pass_size() -> u64 {
    10_000
}

fn default_observer_sleep_ms() -> u64 {
    1000
}

fn default_observer_high_volume_sleep_ms() -> u64 {
    500
}

fn default_observer_high_volume_threshold() -> u64 {
    500_000
}

fn default_max_check_rows() -> i64 {
    1000
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            batch_commit_size: default_batch_commit_size(),
            batch_progress_report_size: default_batch_progress_report_size(),
            column_hash_method: HashMode::default(),
            database_sort: true,
            loader_threads: 0,
            message_queue_size: default_message_queue_size(),
            queue_low_water: None,
            observer_throttle: true,
            observer_throttle_size: default_observer_throttle_size(),
            observer_first_pass_size: default_observer_first_pass_size(),
            observer_vacuum: true,
            observer_sleep_ms: default_observer_sleep_ms(),
            observer_high_volume_sleep_ms: default_observer_high_volume_sleep_ms(),
            observer_high_volume_threshold: default_observer_high_volume_threshold(),
            max_check_rows: default_max_check_rows(),
        }
    }
}

impl CompareConfig {
    pub fn queue_capacity(&self) -> usize {
        self.message_queue_size.max(1)
    }

    /// Low-water mark, clamped below the queue capacity.
    pub fn low_water(&self) -> usize {
        let capacity = self.queue_capacity();
        self.queue_low_water
            .unwrap_or(capacity / 2)
            .min(capacity.saturating_sub(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_commit_size == 0 {
            return Err(ReconcileError::Config(
                "batch_commit_size must be greater than zero".into(),
            ));
        }
        if self.observer_first_pass_size == 0 || self.observer_throttle_size == 0 {
            return Err(ReconcileError::Config(
                "observer throttle sizes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl RowreconConfig {
    pub fn table(&self, alias: &str) -> Option<&TableSpec> {
        self.tables
            .iter()
            .find(|t| t.alias.eq_ignore_ascii_case(alias))
    }
}

/// Strict load: a missing file yields defaults, a malformed one is an error.
pub fn load_config(config_path: &Path) -> Result<RowreconConfig> {
    if !config_path.exists() {
        return Ok(RowreconConfig::default());
    }

    let content = std::fs::read_to_string(config_path)
        .map_err(|e| ReconcileError::Config(format!("{}: {}", config_path.display(), e)))?;
    let config: RowreconConfig = toml::from_str(&content)
        .map_err(|e| ReconcileError::Config(format!("{}: {}", config_path.display(), e)))?;
    config.compare.validate()?;
    Ok(config)
}

pub fn load_config_or_default(config_path: &Path) -> RowreconConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load {}: {}", config_path.display(), e);
        RowreconConfig::default()
    })
}

pub const DEFAULT_CONFIG: &str = r#"# rowrecon configuration
# See: rowrecon config --help

[repository]
path = ".rowrecon/repository.db"

[source]
url = "sqlite:source.db"

[target]
url = "sqlite:target.db"

[compare]
batch_commit_size = 2000
batch_progress_report_size = 1000000
column_hash_method = "database"
database_sort = true
loader_threads = 0
message_queue_size = 1000
observer_throttle = true
observer_throttle_size = 2000000
observer_first_pass_size = 10000
observer_vacuum = true
max_check_rows = 1000

# [[tables]]
# id = 1
# alias = "items"
# parallel_degree = 1
#
# [tables.source]
# schema = "main"
# table = "items"
# compare_sql = "SELECT CAST(id AS TEXT) AS pk_hash, json_object('id', id) AS pk, name FROM items WHERE 1=1"
# pk_columns = ["id"]
# columns = ["name"]
#
# [tables.target]
# schema = "main"
# table = "items"
# compare_sql = "SELECT CAST(id AS TEXT) AS pk_hash, json_object('id', id) AS pk, name FROM items WHERE 1=1"
# pk_columns = ["id"]
# columns = ["name"]
#
# [[tables.columns_map]]
# alias = "id"
# source = { name = "id" }
# target = { name = "id" }
# primary_key = true
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.compare.batch_commit_size, 2000);
        assert_eq!(config.compare.observer_first_pass_size, 10_000);
        assert_eq!(config.compare.column_hash_method, HashMode::Database);
        assert!(config.tables.is_empty());
    }

    #[test]
    fn test_default_config_template_parses() {
        let config: RowreconConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.source.url, "sqlite:source.db");
        assert!(config.compare.database_sort);
    }

    #[test]
    fn test_table_section_parses() {
        let toml_text = r#"
            [compare]
            column_hash_method = "application"
            loader_threads = 2

            [[tables]]
            id = 4
            alias = "Orders"
            parallel_degree = 2

            [tables.source]
            table = "orders"
            mod_column = "id"
            compare_sql = "SELECT 1 WHERE 1=1"
            pk_columns = ["id"]
            columns = ["total"]

            [tables.target]
            table = "orders"
            compare_sql = "SELECT 1 WHERE 1=1"
            pk_columns = ["id"]
            columns = ["total"]

            [[tables.columns_map]]
            alias = "id"
            source = { name = "id" }
            target = { name = "order_id", preserve_case = true }
            primary_key = true
        "#;
        let config: RowreconConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.compare.column_hash_method, HashMode::Application);
        let table = config.table("orders").unwrap();
        assert_eq!(table.tid, 4);
        assert_eq!(table.batch_nbr, 1);
        assert_eq!(table.target.metadata.pk_columns, vec!["id"]);
        assert_eq!(table.columns_map.0[0].target.name, "order_id");
        assert!(table.columns_map.0[0].enabled);
    }

    #[test]
    fn test_malformed_file_is_an_error_but_lenient_load_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rowrecon.toml");
        std::fs::write(&path, "[compare\nbatch_commit_size = ").unwrap();
        assert!(matches!(load_config(&path), Err(ReconcileError::Config(_))));
        assert_eq!(load_config_or_default(&path).compare.message_queue_size, 1000);
    }

    #[test]
    fn test_low_water_defaults_to_half_capacity() {
        let mut compare = CompareConfig::default();
        assert_eq!(compare.low_water(), 500);
        compare.queue_low_water = Some(5000);
        assert_eq!(compare.low_water(), 999);
    }
}
