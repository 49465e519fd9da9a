//! Log record model and decoding.
//!
//! A log file is a stream of concatenated JSON values, each a tagged
//! `LogRecord`. Within one file records are in non-decreasing commit-ts
//! order; nothing is guaranteed across files of different tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use osprey_common::datum::Datum;
use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::types::Timestamp;

/// Kind of schema change a DDL event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlAction {
    CreateSchema,
    DropSchema,
    ModifySchemaCharset,
    CreateTable,
    DropTable,
    AddColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
    TruncateTable,
    /// Any action kind not listed above. Table-level, replayed verbatim.
    #[serde(other)]
    Other,
}

impl DdlAction {
    /// Database-level structural change: applied up front, before any
    /// per-table worker starts.
    pub fn is_schema_level(self) -> bool {
        matches!(
            self,
            DdlAction::CreateSchema | DdlAction::DropSchema | DdlAction::ModifySchemaCharset
        )
    }

    pub fn is_drop_table(self) -> bool {
        self == DdlAction::DropTable
    }
}

/// A schema-change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlEvent {
    pub commit_ts: Timestamp,
    pub schema: String,
    /// Empty for database-level DDL.
    #[serde(default)]
    pub table: String,
    pub action: DdlAction,
    /// Statement text, executed verbatim by the SQL executor.
    pub query: String,
}

/// A row-change event: the post-image of the row as a column map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEvent {
    pub commit_ts: Timestamp,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columns: BTreeMap<String, Datum>,
}

/// Closed sum of everything a log file can hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Ddl(DdlEvent),
    Row(RowEvent),
}

impl LogRecord {
    pub fn commit_ts(&self) -> Timestamp {
        match self {
            LogRecord::Ddl(e) => e.commit_ts,
            LogRecord::Row(e) => e.commit_ts,
        }
    }

    pub fn schema(&self) -> &str {
        match self {
            LogRecord::Ddl(e) => &e.schema,
            LogRecord::Row(e) => &e.schema,
        }
    }
}

/// Decode a whole log file. Any malformed record is fatal.
pub fn decode_records(data: &[u8], file: &str) -> RestoreResult<Vec<LogRecord>> {
    let mut records = Vec::new();
    for item in serde_json::Deserializer::from_slice(data).into_iter::<LogRecord>() {
        records.push(item.map_err(|e| RestoreError::decode(file, e))?);
    }
    Ok(records)
}
