use serde::{Deserialize, Serialize};

use super::row::Side;

/// Where row and primary-key hashes are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// The compare query already returns `pk_hash` and a single column hash.
    #[default]
    Database,
    /// The compare query returns raw projections; hashing happens in-process.
    Application,
}

/// A physical column name on one side plus its case rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub name: String,
    #[serde(default)]
    pub preserve_case: bool,
}

/// Mapping of one logical column between source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub alias: String,
    pub source: ColumnRef,
    pub target: ColumnRef,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ColumnMap(pub Vec<ColumnMapping>);

impl ColumnMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.0.iter()
    }

    /// Look a column up by its physical name on `side` (case-insensitive).
    pub fn find(&self, side: Side, name: &str) -> Option<&ColumnMapping> {
        self.0
            .iter()
            .find(|m| m.column(side).name.eq_ignore_ascii_case(name))
    }

    /// Look a column up by either side's name, source first.
    pub fn resolve(&self, name: &str) -> Option<&ColumnMapping> {
        self.find(Side::Source, name)
            .or_else(|| self.find(Side::Target, name))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.0.iter().filter(|m| m.enabled)
    }

    /// Enabled, non-key mappings in declaration order.
    pub fn non_key(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.0.iter().filter(|m| m.enabled && !m.primary_key)
    }
}

impl ColumnMapping {
    pub fn column(&self, side: Side) -> &ColumnRef {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }
}

/// Column metadata for one side of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ColumnMetadata {
    /// Ordered primary-key column names.
    #[serde(default)]
    pub pk_columns: Vec<String>,
    /// Ordered non-key column names.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl ColumnMetadata {
    pub fn has_primary_key(&self) -> bool {
        self.pk_columns.iter().any(|c| !c.trim().is_empty())
    }
}

/// One side of a table: location, partitioning column, and the ready-made
/// compare query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideMap {
    #[serde(default)]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub schema_preserve_case: bool,
    #[serde(default)]
    pub table_preserve_case: bool,
    /// Column used for the deterministic modulus split.
    #[serde(default)]
    pub mod_column: Option<String>,
    /// Compare query; returns `pk_hash, pk, ...` and ends in a `WHERE`
    /// clause that further predicates can be `AND`-ed onto.
    pub compare_sql: String,
    /// Raw-column variant used to re-fetch full rows in check mode.
    #[serde(default)]
    pub check_sql: Option<String>,
    #[serde(flatten)]
    pub metadata: ColumnMetadata,
}

impl SideMap {
    pub fn check_sql(&self) -> &str {
        self.check_sql.as_deref().unwrap_or(&self.compare_sql)
    }

    pub fn has_mod_column(&self) -> bool {
        self.mod_column
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

/// A table registered for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(rename = "id")]
    pub tid: i64,
    pub alias: String,
    #[serde(default = "default_batch_nbr")]
    pub batch_nbr: i64,
    #[serde(default = "default_parallel_degree")]
    pub parallel_degree: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SideMap,
    pub target: SideMap,
    #[serde(default)]
    pub columns_map: ColumnMap,
}

fn default_batch_nbr() -> i64 {
    1
}

fn default_parallel_degree() -> u32 {
    1
}

impl TableSpec {
    pub fn side(&self, side: Side) -> &SideMap {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    pub fn has_primary_key(&self) -> bool {
        self.source.metadata.has_primary_key() && self.target.metadata.has_primary_key()
    }

    /// Mod column on `side`, falling back to the other side's.
    pub fn mod_column(&self, side: Side) -> Option<&str> {
        let own = self.side(side);
        let other = self.side(side.other());
        if own.has_mod_column() {
            own.mod_column.as_deref()
        } else if other.has_mod_column() {
            other.mod_column.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(pk: &[&str]) -> SideMap {
        SideMap {
            schema: "main".into(),
            table: "items".into(),
            schema_preserve_case: false,
            table_preserve_case: false,
            mod_column: None,
            compare_sql: "SELECT 1 WHERE 1=1".into(),
            check_sql: None,
            metadata: ColumnMetadata {
                pk_columns: pk.iter().map(|s| s.to_string()).collect(),
                columns: vec!["name".into()],
            },
        }
    }

    #[test]
    fn test_primary_key_required_on_both_sides() {
        let mut spec = TableSpec {
            tid: 1,
            alias: "items".into(),
            batch_nbr: 1,
            parallel_degree: 1,
            enabled: true,
            source: side(&["id"]),
            target: side(&[]),
            columns_map: ColumnMap::default(),
        };
        assert!(!spec.has_primary_key());
        spec.target = side(&["id"]);
        assert!(spec.has_primary_key());
        spec.source = side(&[" "]);
        assert!(!spec.has_primary_key());
    }

    #[test]
    fn test_check_sql_falls_back_to_compare_sql() {
        let mut s = side(&["id"]);
        assert_eq!(s.check_sql(), "SELECT 1 WHERE 1=1");
        s.check_sql = Some("SELECT 2 WHERE 1=1".into());
        assert_eq!(s.check_sql(), "SELECT 2 WHERE 1=1");
    }
}
