use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::time::Duration;

use super::{FetchedRow, Result, RowSource, SourceError, SourceRow};
use crate::models::Value;

/// Row source over a SQLite database.
#[derive(Clone)]
pub struct SqliteRowSource {
    pool: SqlitePool,
}

impl SqliteRowSource {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn column_name(row: &SqliteRow, index: usize) -> String {
    row.columns()
        .get(index)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| index.to_string())
}

/// Decode one cell by its storage class.
fn decode_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let decode_err = |e: sqlx::Error| SourceError::Decode {
        column: column_name(row, index),
        reason: e.to_string(),
    };

    let raw = row.try_get_raw(index).map_err(decode_err)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    match type_name.as_str() {
        "INTEGER" => Ok(Value::from(row.try_get::<i64, _>(index).map_err(decode_err)?)),
        "REAL" => {
            let f: f64 = row.try_get(index).map_err(decode_err)?;
            Ok(serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::Text(f.to_string())))
        }
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(index).map_err(decode_err)?;
            Ok(Value::Text(String::from_utf8_lossy(&bytes).into_owned()))
        }
        _ => Ok(Value::Text(row.try_get::<String, _>(index).map_err(decode_err)?)),
    }
}

fn decode_source_row(row: &SqliteRow) -> Result<SourceRow> {
    if row.len() < 3 {
        return Err(SourceError::Decode {
            column: format!("#{}", row.len()),
            reason: "compare query must return pk_hash, pk and at least one column".into(),
        });
    }

    let required = |index: usize| -> Result<String> {
        decode_value(row, index)?
            .as_text()
            .ok_or_else(|| SourceError::Decode {
                column: column_name(row, index),
                reason: "unexpected NULL".into(),
            })
    };

    let pk_hash = required(0)?;
    let pk = required(1)?;
    let values = (2..row.len())
        .map(|i| decode_value(row, i).map(|v| v.as_text()))
        .collect::<Result<Vec<_>>>()?;

    Ok(SourceRow { pk_hash, pk, values })
}

#[async_trait]
impl RowSource for SqliteRowSource {
    fn stream<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<SourceRow>> {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(|row| match row {
                Ok(row) => decode_source_row(&row),
                Err(e) => Err(SourceError::Database(e)),
            })
            .boxed()
    }

    async fn fetch(&self, sql: &str, binds: &[Value]) -> Result<Vec<FetchedRow>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                Value::Text(s) => query.bind(s.clone()),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| Ok((column_name(row, i), decode_value(row, i)?)))
                    .collect::<Result<FetchedRow>>()
            })
            .collect()
    }

    fn partition_predicate(&self, column: &str, degree: u32, partition: u32) -> String {
        format!(" AND ({} % {}) = {}", column, degree, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn create_test_source() -> (SqliteRowSource, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            temp_dir.path().join("side.db").display()
        );
        let source = SqliteRowSource::connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, qty REAL)")
            .execute(source.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO items VALUES (1, 'a', 1.5), (2, NULL, 2.0), (3, 'c', NULL)")
            .execute(source.pool())
            .await
            .unwrap();
        (source, temp_dir)
    }

    #[tokio::test]
    async fn test_stream_decodes_compare_rows() {
        let (source, _temp) = create_test_source().await;
        let sql = "SELECT CAST(id AS TEXT), json_object('id', id), name, qty FROM items WHERE 1=1 ORDER BY id";
        let rows: Vec<SourceRow> = source.stream(sql).try_collect().await.unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].pk_hash, "1");
        assert_eq!(rows[0].pk, r#"{"id":1}"#);
        assert_eq!(rows[0].values, vec![Some("a".into()), Some("1.5".into())]);
        assert_eq!(rows[1].values[0], None);
    }

    #[tokio::test]
    async fn test_null_key_is_a_row_local_error() {
        let (source, _temp) = create_test_source().await;
        let sql = "SELECT name, json_object('id', id), qty FROM items WHERE 1=1 ORDER BY id";
        let results: Vec<Result<SourceRow>> = source.stream(sql).collect().await;

        assert!(results[0].is_ok());
        assert!(matches!(&results[1], Err(e) if e.is_row_local()));
    }

    #[tokio::test]
    async fn test_partition_predicate_splits_rows() {
        let (source, _temp) = create_test_source().await;
        let mut seen = 0;
        for partition in 0..2 {
            let sql = format!(
                "SELECT id, json_object('id', id), name FROM items WHERE 1=1{}",
                source.partition_predicate("id", 2, partition)
            );
            let rows: Vec<SourceRow> = source.stream(&sql).try_collect().await.unwrap();
            seen += rows.len();
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_fetch_binds_key_values() {
        let (source, _temp) = create_test_source().await;
        let sql = format!(
            "SELECT id, name, qty FROM items WHERE 1=1{}",
            source.key_predicate("id")
        );
        let rows = source.fetch(&sql, &[Value::from(3)]).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], ("id".to_string(), Value::from(3)));
        assert_eq!(rows[0][1].1, Value::from("c"));
        assert_eq!(rows[0][2].1, Value::Null);
    }
}
