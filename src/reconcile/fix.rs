//! Repair statements that bring a target row in line with its source row.

use crate::error::{ReconcileError, Result};
use crate::models::{ColumnRef, FixStatement, PrimaryKey, Side, TableSpec, Value};
use crate::source::FetchedRow;

/// Quote an identifier only when its case must be preserved.
pub fn quote_ident(name: &str, preserve_case: bool, quote: char) -> String {
    if preserve_case {
        format!("{q}{}{q}", name, q = quote)
    } else {
        name.to_string()
    }
}

/// Name of a key column on `side`, mapped through the column map when a
/// mapping exists.
pub fn side_column(table: &TableSpec, side: Side, column: &str, quote: char) -> String {
    let clean = PrimaryKey::clean_column(column);
    match table.columns_map.resolve(&clean) {
        Some(mapping) => {
            let col = mapping.column(side);
            quote_ident(&col.name, col.preserve_case, quote)
        }
        None => clean,
    }
}

pub struct FixGenerator<'a> {
    table: &'a TableSpec,
    quote: char,
}

impl<'a> FixGenerator<'a> {
    pub fn new(table: &'a TableSpec, quote: char) -> Self {
        Self { table, quote }
    }

    fn target_table(&self) -> String {
        let map = &self.table.target;
        let table = quote_ident(&map.table, map.table_preserve_case, self.quote);
        if map.schema.is_empty() {
            table
        } else {
            format!(
                "{}.{}",
                quote_ident(&map.schema, map.schema_preserve_case, self.quote),
                table
            )
        }
    }

    fn target_ident(&self, col: &ColumnRef) -> String {
        quote_ident(&col.name, col.preserve_case, self.quote)
    }

    fn where_clause(&self, key: &PrimaryKey) -> String {
        key.iter()
            .map(|(column, value)| {
                let column = side_column(self.table, Side::Target, column, self.quote);
                match value {
                    Value::Null => format!("{} IS NULL", column),
                    v => format!("{} = {}", column, v.to_sql_literal()),
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn row_value<'r>(row: &'r FetchedRow, column: &ColumnRef) -> Option<&'r Value> {
        let wanted = PrimaryKey::clean_column(&column.name);
        row.iter()
            .find(|(name, _)| PrimaryKey::clean_column(name).eq_ignore_ascii_case(&wanted))
            .map(|(_, value)| value)
    }

    /// A row fetched with the hash-only compare query carries the key and a
    /// column hash but none of the data columns; it cannot feed a fix.
    fn require_data_columns(&self, row: &FetchedRow) -> Result<()> {
        let mut data = self.table.columns_map.non_key().peekable();
        if data.peek().is_none() || data.any(|m| Self::row_value(row, &m.source).is_some()) {
            return Ok(());
        }
        Err(ReconcileError::Fix(format!(
            "fetched row of {} holds none of the mapped data columns (set check_sql)",
            self.table.alias
        )))
    }

    /// Source value for a mapped column: the fetched row first, then the key.
    /// Anything unresolvable becomes NULL.
    fn source_value(&self, key: &PrimaryKey, row: &FetchedRow, column: &ColumnRef) -> Value {
        if let Some(value) = Self::row_value(row, column) {
            return value.clone();
        }
        let wanted = PrimaryKey::clean_column(&column.name);
        if let Some(value) = key.get(&wanted) {
            return value.clone();
        }
        tracing::warn!(
            table = %self.table.alias,
            "Column {} not found in source row for key {}; using NULL",
            column.name,
            key
        );
        Value::Null
    }

    /// Row only on target.
    pub fn delete(&self, key: &PrimaryKey) -> FixStatement {
        FixStatement {
            primary_key: key.to_json(),
            sql_text: format!(
                "DELETE FROM {} WHERE {};",
                self.target_table(),
                self.where_clause(key)
            ),
        }
    }

    /// Row only on source.
    pub fn insert(&self, key: &PrimaryKey, source_row: &FetchedRow) -> Result<FixStatement> {
        self.require_data_columns(source_row)?;
        let (columns, values): (Vec<String>, Vec<String>) = self
            .table
            .columns_map
            .enabled()
            .map(|m| {
                (
                    self.target_ident(&m.target),
                    self.source_value(key, source_row, &m.source).to_sql_literal(),
                )
            })
            .unzip();

        if columns.is_empty() {
            return Err(ReconcileError::Fix(format!("no mapped columns for INSERT of {}", key)));
        }

        Ok(FixStatement {
            primary_key: key.to_json(),
            sql_text: format!(
                "INSERT INTO {} ({}) VALUES ({});",
                self.target_table(),
                columns.join(", "),
                values.join(", ")
            ),
        })
    }

    /// Row on both sides with differing columns: set every non-key target
    /// column to the source value.
    pub fn update(&self, key: &PrimaryKey, source_row: &FetchedRow) -> Result<FixStatement> {
        self.require_data_columns(source_row)?;
        let assignments: Vec<String> = self
            .table
            .columns_map
            .non_key()
            .map(|m| {
                format!(
                    "{} = {}",
                    self.target_ident(&m.target),
                    self.source_value(key, source_row, &m.source).to_sql_literal()
                )
            })
            .collect();

        if assignments.is_empty() {
            return Err(ReconcileError::Fix(format!("no non-key columns for UPDATE of {}", key)));
        }

        Ok(FixStatement {
            primary_key: key.to_json(),
            sql_text: format!(
                "UPDATE {} SET {} WHERE {};",
                self.target_table(),
                assignments.join(", "),
                self.where_clause(key)
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnMap, ColumnMapping, ColumnMetadata, SideMap};

    fn col(name: &str, preserve_case: bool) -> ColumnRef {
        ColumnRef {
            name: name.into(),
            preserve_case,
        }
    }

    fn mapping(source: &str, target: ColumnRef, primary_key: bool) -> ColumnMapping {
        ColumnMapping {
            alias: source.into(),
            source: col(source, false),
            target,
            primary_key,
            enabled: true,
        }
    }

    fn side(schema: &str, table: &str, preserve: bool) -> SideMap {
        SideMap {
            schema: schema.into(),
            table: table.into(),
            schema_preserve_case: false,
            table_preserve_case: preserve,
            mod_column: None,
            compare_sql: "SELECT 1 WHERE 1=1".into(),
            check_sql: None,
            metadata: ColumnMetadata {
                pk_columns: vec!["id".into()],
                columns: vec!["name".into()],
            },
        }
    }

    fn table() -> TableSpec {
        TableSpec {
            tid: 1,
            alias: "customers".into(),
            batch_nbr: 1,
            parallel_degree: 1,
            enabled: true,
            source: side("app", "customers", false),
            target: side("crm", "Customers", true),
            columns_map: ColumnMap(vec![
                mapping("id", col("customer_id", false), true),
                mapping("name", col("FullName", true), false),
                mapping("note", col("note", false), false),
            ]),
        }
    }

    fn key(id: i64) -> PrimaryKey {
        let mut k = PrimaryKey::new();
        k.push("id", Value::from(id));
        k
    }

    #[test]
    fn test_delete_uses_mapped_key_column() {
        let t = table();
        let fix = FixGenerator::new(&t, '"').delete(&key(4));
        assert_eq!(fix.sql_text, r#"DELETE FROM crm."Customers" WHERE customer_id = 4;"#);
        assert_eq!(fix.primary_key, r#"{"id":4}"#);
    }

    #[test]
    fn test_insert_maps_names_and_nulls_missing_columns() {
        let t = table();
        let row: FetchedRow = vec![
            ("pk_hash".into(), Value::from("3")),
            ("NAME".into(), Value::from("O'Neil")),
        ];
        let fix = FixGenerator::new(&t, '`').insert(&key(3), &row).unwrap();
        assert_eq!(
            fix.sql_text,
            "INSERT INTO crm.`Customers` (customer_id, `FullName`, note) VALUES (3, 'O''Neil', NULL);"
        );
    }

    #[test]
    fn test_update_sets_every_non_key_column() {
        let t = table();
        let row: FetchedRow = vec![
            ("name".into(), Value::from("b")),
            ("note".into(), Value::Null),
        ];
        let fix = FixGenerator::new(&t, '"').update(&key(2), &row).unwrap();
        assert_eq!(
            fix.sql_text,
            r#"UPDATE crm."Customers" SET "FullName" = 'b', note = NULL WHERE customer_id = 2;"#
        );
    }

    #[test]
    fn test_update_without_non_key_columns_is_omitted() {
        let mut t = table();
        t.columns_map.0.retain(|m| m.primary_key);
        let err = FixGenerator::new(&t, '"').update(&key(1), &vec![]).unwrap_err();
        assert!(matches!(err, ReconcileError::Fix(_)));
    }

    #[test]
    fn test_hash_only_row_yields_no_fix() {
        let t = table();
        let row: FetchedRow = vec![
            ("pk_hash".into(), Value::from("2")),
            ("pk".into(), Value::from(r#"{"id":2}"#)),
            ("name || '|' || note".into(), Value::from("b|")),
        ];
        let fixer = FixGenerator::new(&t, '"');
        assert!(matches!(fixer.update(&key(2), &row), Err(ReconcileError::Fix(_))));
        assert!(matches!(fixer.insert(&key(2), &row), Err(ReconcileError::Fix(_))));
        // DELETE needs nothing from the source row.
        assert!(fixer.delete(&key(2)).sql_text.starts_with("DELETE FROM"));
    }
}
