//! Row sources: the per-side database seam consumed by extraction workers and
//! the row-level validator.

pub mod sqlite;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::Value;

pub use sqlite::SqliteRowSource;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },
}

impl SourceError {
    /// Errors confined to a single row; the rest of the stream is still usable.
    pub fn is_row_local(&self) -> bool {
        matches!(self, SourceError::Decode { .. })
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// One row of a compare query.
///
/// Column 1 is the primary-key hash (or raw key projection), column 2 the
/// structured key JSON, the remaining columns either a single column hash or
/// the raw projections to hash in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub pk_hash: String,
    pub pk: String,
    pub values: Vec<Option<String>>,
}

/// A fully fetched row: `(column name, value)` in query order.
pub type FetchedRow = Vec<(String, Value)>;

#[async_trait]
pub trait RowSource: Send + Sync {
    /// Stream the rows of a compare query.
    fn stream<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<SourceRow>>;

    /// Run a query with positional binds and return every row.
    async fn fetch(&self, sql: &str, binds: &[Value]) -> Result<Vec<FetchedRow>>;

    /// Predicate restricting a query to one modulus partition.
    fn partition_predicate(&self, column: &str, degree: u32, partition: u32) -> String {
        format!(" AND mod({}, {}) = {}", column, degree, partition)
    }

    /// Equality predicate for one key column with a bind marker.
    fn key_predicate(&self, column: &str) -> String {
        format!(" AND {} = ?", column)
    }

    fn quote_char(&self) -> char {
        '"'
    }
}
