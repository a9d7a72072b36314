//! The wire-level partial result a server returns for one sub-query.
//!
//! A `DataTable` carries a data schema (column names and semantic types), a
//! row block, and a string metadata map with execution counters, optional
//! trace text, and per-shard exception entries.
//!
//! Layout conventions by query shape:
//! - selection: one column per selected column, one row per document;
//! - aggregation: one column per aggregation, a single row of partials;
//! - group-by: one STRING column per group-by expression followed by one
//!   column per aggregation, one row per group.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// Magic bytes prefixing every serialized data table.
pub const DATA_TABLE_MAGIC: &[u8; 4] = b"KSDT";
/// Wire format version; bump on backward-incompatible layout changes.
pub const DATA_TABLE_FORMAT_VERSION: u32 = 1;

/// Metadata keys servers populate on every data table.
pub const NUM_DOCS_SCANNED_KEY: &str = "numDocsScanned";
pub const NUM_ENTRIES_SCANNED_IN_FILTER_KEY: &str = "numEntriesScannedInFilter";
pub const NUM_ENTRIES_SCANNED_POST_FILTER_KEY: &str = "numEntriesScannedPostFilter";
pub const TOTAL_DOCS_KEY: &str = "totalDocs";
pub const TRACE_INFO_KEY: &str = "traceInfo";
/// Exception entries are keyed `Exception<code>` with a human-readable message.
pub const EXCEPTION_KEY_PREFIX: &str = "Exception";

/// Semantic column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Long,
    Double,
    String,
    Object,
}

/// Column names and types of a data table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
}

impl DataSchema {
    pub fn new(column_names: Vec<String>, column_types: Vec<ColumnType>) -> Self {
        debug_assert_eq!(column_names.len(), column_types.len());
        Self {
            column_names,
            column_types,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.column_names.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }
}

/// Opaque aggregation intermediates carried in OBJECT columns.
///
/// A closed set: every variant has an associative, commutative merge in the
/// reduce layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectValue {
    /// AVG partial: merge adds sums and counts.
    AvgPair { sum: f64, count: i64 },
    /// DISTINCTCOUNT partial: merge is set union.
    DistinctSet(std::collections::BTreeSet<String>),
    /// Percentile partial: merge concatenates samples.
    PercentileSamples(Vec<f64>),
}

/// One cell of a data table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Long(i64),
    Double(f64),
    Text(String),
    Object(ObjectValue),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Long(_) => ColumnType::Long,
            Value::Double(_) => ColumnType::Double,
            Value::Text(_) => ColumnType::String,
            Value::Object(_) => ColumnType::Object,
        }
    }

    /// Rendered form used in selection rows and group keys.
    pub fn render(&self) -> String {
        match self {
            Value::Long(v) => v.to_string(),
            Value::Double(v) => format_double(*v),
            Value::Text(v) => v.clone(),
            Value::Object(_) => "[object]".to_string(),
        }
    }
}

/// Render a double the way responses present it: up to five fraction
/// digits, trailing zeros trimmed.
pub fn format_double(v: f64) -> String {
    let formatted = format!("{:.5}", v);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A server's partial result for one sub-query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub schema: Option<DataSchema>,
    pub rows: Vec<Vec<Value>>,
    pub metadata: BTreeMap<String, String>,
}

impl DataTable {
    pub fn new(schema: DataSchema, rows: Vec<Vec<Value>>) -> Self {
        Self {
            schema: Some(schema),
            rows,
            metadata: BTreeMap::new(),
        }
    }

    /// A table with metadata only, as servers send for pure error responses.
    pub fn metadata_only() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Counter metadata parsed as u64; absent or unparsable entries read as 0.
    pub fn metadata_counter(&self, key: &str) -> u64 {
        self.metadata
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Attach a server-side exception entry.
    pub fn add_exception(&mut self, code: i32, message: impl Into<String>) {
        self.metadata
            .insert(format!("{}{}", EXCEPTION_KEY_PREFIX, code), message.into());
    }

    /// All `Exception<code>` metadata entries as `(code, message)` pairs.
    pub fn exceptions(&self) -> Vec<(i32, String)> {
        self.metadata
            .iter()
            .filter_map(|(key, message)| {
                let code = key.strip_prefix(EXCEPTION_KEY_PREFIX)?;
                let code: i32 = code.parse().ok()?;
                Some((code, message.clone()))
            })
            .collect()
    }

    pub fn get_long(&self, row: usize, col: usize) -> QueryResult<i64> {
        match self.cell(row, col)? {
            Value::Long(v) => Ok(*v),
            other => Err(QueryError::Internal(format!(
                "expected LONG at ({}, {}), found {:?}",
                row, col, other
            ))),
        }
    }

    pub fn get_double(&self, row: usize, col: usize) -> QueryResult<f64> {
        match self.cell(row, col)? {
            Value::Double(v) => Ok(*v),
            // Servers may legally narrow an all-integral column.
            Value::Long(v) => Ok(*v as f64),
            other => Err(QueryError::Internal(format!(
                "expected DOUBLE at ({}, {}), found {:?}",
                row, col, other
            ))),
        }
    }

    pub fn get_string(&self, row: usize, col: usize) -> QueryResult<&str> {
        match self.cell(row, col)? {
            Value::Text(v) => Ok(v.as_str()),
            other => Err(QueryError::Internal(format!(
                "expected STRING at ({}, {}), found {:?}",
                row, col, other
            ))),
        }
    }

    pub fn get_object(&self, row: usize, col: usize) -> QueryResult<&ObjectValue> {
        match self.cell(row, col)? {
            Value::Object(v) => Ok(v),
            other => Err(QueryError::Internal(format!(
                "expected OBJECT at ({}, {}), found {:?}",
                row, col, other
            ))),
        }
    }

    fn cell(&self, row: usize, col: usize) -> QueryResult<&Value> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .ok_or_else(|| {
                QueryError::Internal(format!("data table cell ({}, {}) out of bounds", row, col))
            })
    }

    /// Serialize with the magic + version + length-prefixed payload framing.
    pub fn to_bytes(&self) -> QueryResult<Bytes> {
        let payload = bincode::serialize(self)
            .map_err(|e| QueryError::Internal(format!("data table encode failed: {}", e)))?;
        let mut buf = BytesMut::with_capacity(DATA_TABLE_MAGIC.len() + 8 + payload.len());
        buf.put_slice(DATA_TABLE_MAGIC);
        buf.put_u32(DATA_TABLE_FORMAT_VERSION);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a framed data table, validating magic, version, and length.
    pub fn from_bytes(bytes: &[u8]) -> QueryResult<DataTable> {
        let mut buf = bytes;
        if buf.remaining() < DATA_TABLE_MAGIC.len() + 8 {
            return Err(QueryError::DataTableDeserialization(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != DATA_TABLE_MAGIC {
            return Err(QueryError::DataTableDeserialization(
                "bad data table magic".to_string(),
            ));
        }
        let version = buf.get_u32();
        if version != DATA_TABLE_FORMAT_VERSION {
            return Err(QueryError::DataTableDeserialization(format!(
                "unsupported data table format version {}",
                version
            )));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(QueryError::DataTableDeserialization(format!(
                "truncated data table payload: expected {} bytes, have {}",
                len,
                buf.remaining()
            )));
        }
        bincode::deserialize(&buf[..len])
            .map_err(|e| QueryError::DataTableDeserialization(format!("decode failed: {}", e)))
    }
}
