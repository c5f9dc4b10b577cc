use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Which side of a comparison a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Target,
            Side::Target => Side::Source,
        }
    }

    /// Durable finding relation for this side.
    pub fn finding_table(self) -> &'static str {
        match self {
            Side::Source => "dc_source",
            Side::Target => "dc_target",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell value, as moved through keys, diffs and fix statements.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Value {
    /// Text projection used for cell-by-cell comparison. `None` for NULL.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// SQL literal: `NULL`, bare numbers/booleans, single-quoted text with
    /// embedded quotes doubled.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::Text(s),
            // Nested structures have no column equivalent; keep their JSON text.
            other => Value::Text(other.to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// Structured primary key: ordered `(column, value)` pairs.
///
/// Serializes to a JSON object (`{"id":42}`) with insertion order preserved,
/// so the same key always produces the same text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrimaryKey(Vec<(String, Value)>);

impl PrimaryKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.0.push((column.into(), value));
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        // Serializing strings and numbers into a Vec<u8> cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }

    /// Key columns with identifier quoting characters stripped.
    pub fn clean_column(column: &str) -> String {
        column.replace(['`', '"'], "")
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl Serialize for PrimaryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (column, value) in &self.0 {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PrimaryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = PrimaryKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object of primary key columns")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PrimaryKey, A::Error> {
                let mut key = PrimaryKey(Vec::with_capacity(access.size_hint().unwrap_or(1)));
                while let Some((column, value)) = access.next_entry::<String, Value>()? {
                    if key.0.iter().any(|(c, _)| *c == column) {
                        return Err(de::Error::custom(format!(
                            "duplicate key column '{}'",
                            column
                        )));
                    }
                    key.0.push((column, value));
                }
                Ok(key)
            }
        }

        deserializer.deserialize_map(KeyVisitor)
    }
}

/// One hashed row fingerprint, as written into a staging relation.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub pk_hash: String,
    pub column_hash: String,
    /// Canonical primary key JSON.
    pub pk: String,
}

/// Final classification of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    MissingSource,
    MissingTarget,
    NotEqual,
}

impl Disposition {
    /// Code stored in `compare_result`. Missing rows carry `m` on whichever
    /// side they exist.
    pub fn code(self) -> &'static str {
        match self {
            Disposition::MissingSource | Disposition::MissingTarget => "m",
            Disposition::NotEqual => "n",
        }
    }

    /// Decode a stored code for a finding that lives on `side`.
    pub fn from_code(side: Side, code: &str) -> Option<Self> {
        match (code, side) {
            ("n", _) => Some(Disposition::NotEqual),
            ("m", Side::Source) => Some(Disposition::MissingTarget),
            ("m", Side::Target) => Some(Disposition::MissingSource),
            _ => None,
        }
    }

    /// The side a missing row is present on.
    pub fn present_side(self) -> Option<Side> {
        match self {
            Disposition::MissingSource => Some(Side::Target),
            Disposition::MissingTarget => Some(Side::Source),
            Disposition::NotEqual => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Disposition::MissingSource => "Missing Source",
            Disposition::MissingTarget => "Missing Target",
            Disposition::NotEqual => "Not Equal",
        })
    }
}

/// A staged row that survived to finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub tid: i64,
    pub pk_hash: String,
    pub pk: String,
    pub batch_nbr: i64,
    pub disposition: Option<Disposition>,
}
