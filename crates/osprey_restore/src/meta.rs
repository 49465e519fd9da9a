//! Log layout: metadata file, directory conventions, and file-name codecs.
//!
//! The capture sink writes:
//! - `log.meta` — JSON snapshot of table ids/names and the global resolved ts
//! - `ddls/ddl.<maxu64 - commit_ts>` — DDL batches; the inverted timestamp
//!   makes a lexicographic listing come back newest-first
//! - `t_<table_id>/cdclog.<last_event_ts>` (or bare `cdclog`) — row batches;
//!   the suffix records the *last* event's ts in the file

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::types::{TableId, Timestamp};

pub const META_FILE: &str = "log.meta";
pub const DDL_DIR: &str = "ddls";
pub const DDL_FILE_PREFIX: &str = "ddl";
pub const ROW_LOG_PREFIX: &str = "cdclog";
pub const TABLE_DIR_PREFIX: &str = "t_";

/// Immutable snapshot of what existed at log-capture time. Loaded once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogMeta {
    /// Backup-side table id → backtick-quoted `schema`.`table` name.
    pub names: HashMap<i64, String>,
    /// Highest commit ts up to which the captured log is known complete.
    pub global_resolved_ts: u64,
}

impl LogMeta {
    pub fn parse(data: &[u8], file: &str) -> RestoreResult<LogMeta> {
        serde_json::from_slice(data).map_err(|e| RestoreError::decode(file, e))
    }

    pub fn resolved_ts(&self) -> Timestamp {
        Timestamp(self.global_resolved_ts)
    }
}

/// Decode a DDL file name. `Ok(None)` means "not a DDL file, skip it"
/// (warned); a DDL-shaped name with an unparsable suffix is fatal.
pub fn ddl_file_commit_ts(file_name: &str) -> RestoreResult<Option<Timestamp>> {
    let Some((prefix, suffix)) = split_two(file_name) else {
        warn!(file = file_name, "unexpected ddl file name shape, skipping");
        return Ok(None);
    };
    if prefix != DDL_FILE_PREFIX {
        warn!(file = file_name, "file does not start with ddl prefix, skipping");
        return Ok(None);
    }
    let encoded: u64 = suffix
        .parse()
        .map_err(|e| RestoreError::decode(file_name, e))?;
    // File names hold maxu64 - commit_ts so listings are newest-first.
    Ok(Some(Timestamp(u64::MAX - encoded)))
}

/// Decoded name of a row-change file within a table directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFileName {
    /// Bare `cdclog` — written by some sinks, always collected and ordered
    /// after every suffixed file.
    Bare,
    /// `cdclog.<ts>` where ts is the last event's commit ts.
    LastTs(Timestamp),
}

/// Decode a row-change file name; `Ok(None)` means "not a row log, skip".
pub fn row_file_name(file_name: &str) -> RestoreResult<Option<RowFileName>> {
    if file_name == ROW_LOG_PREFIX {
        return Ok(Some(RowFileName::Bare));
    }
    let Some((prefix, suffix)) = split_two(file_name) else {
        warn!(file = file_name, "unexpected row log file name shape, skipping");
        return Ok(None);
    };
    if prefix != ROW_LOG_PREFIX {
        warn!(file = file_name, "file does not start with row log prefix, skipping");
        return Ok(None);
    }
    let ts: u64 = suffix
        .parse()
        .map_err(|e| RestoreError::decode(file_name, e))?;
    Ok(Some(RowFileName::LastTs(Timestamp(ts))))
}

fn split_two(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.splitn(3, '.');
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}

/// Strip backtick quoting from a `schema`.`table` pair recorded in
/// `log.meta`. Unquoted names split on the first dot.
pub fn parse_quoted_name(name: &str) -> (String, String) {
    if let Some(rest) = name.strip_prefix('`') {
        if let Some((schema, tail)) = rest.split_once("`.`") {
            if let Some(table) = tail.strip_suffix('`') {
                return (schema.to_string(), table.to_string());
            }
        }
    }
    match name.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => (String::new(), name.to_string()),
    }
}

/// Case-insensitive `schema.table` predicate. Empty rule set accepts all;
/// `*` matches any schema or table name.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    rules: Vec<(String, String)>,
}

impl TableFilter {
    /// Accept everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from `schema.table` rules; the name parts may be `*`.
    pub fn new(rules: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(s, t)| (s.to_lowercase(), t.to_lowercase()))
                .collect(),
        }
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let (schema, table) = (schema.to_lowercase(), table.to_lowercase());
        self.rules.iter().any(|(rs, rt)| {
            (rs == "*" || *rs == schema) && (rt == "*" || *rt == table)
        })
    }
}

/// A table surviving name dedup and filtering, ready for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSource {
    /// Backup-side table id (names the `t_<id>` log directory).
    pub table_id: TableId,
    pub schema: String,
    pub table: String,
}

impl TableSource {
    pub fn log_dir(&self) -> String {
        format!("{}{}", TABLE_DIR_PREFIX, self.table_id.0)
    }
}

/// Resolve the tables to replay: a name dropped and re-created during
/// capture appears under two ids, and only the highest id is live.
pub fn pick_tables(meta: &LogMeta, filter: &TableFilter) -> Vec<TableSource> {
    let mut by_name: HashMap<&str, i64> = HashMap::new();
    for (&table_id, name) in &meta.names {
        by_name
            .entry(name.as_str())
            .and_modify(|tid| *tid = (*tid).max(table_id))
            .or_insert(table_id);
    }

    let mut picked: Vec<TableSource> = Vec::with_capacity(by_name.len());
    for (name, table_id) in by_name {
        let (schema, table) = parse_quoted_name(name);
        if !filter.matches(&schema, &table) {
            debug!(schema = %schema, table = %table, table_id, "table filtered out");
            continue;
        }
        picked.push(TableSource {
            table_id: TableId(table_id),
            schema,
            table,
        });
    }
    // Deterministic worker order.
    picked.sort_by_key(|t| t.table_id);
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let raw = br#"{"names": {"45": "`test`.`t1`"}, "global_resolved_ts": 900}"#;
        let meta = LogMeta::parse(raw, "log.meta").unwrap();
        assert_eq!(meta.resolved_ts(), Timestamp(900));
        assert_eq!(meta.names.get(&45).unwrap(), "`test`.`t1`");
    }

    #[test]
    fn test_meta_malformed_is_decode_error() {
        assert!(matches!(
            LogMeta::parse(b"{oops", "log.meta"),
            Err(RestoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_ddl_file_name_decode() {
        let encoded = u64::MAX - 120;
        let ts = ddl_file_commit_ts(&format!("ddl.{}", encoded)).unwrap();
        assert_eq!(ts, Some(Timestamp(120)));

        // Foreign file names are skipped, not errors.
        assert_eq!(ddl_file_commit_ts("checkpoint").unwrap(), None);
        assert_eq!(ddl_file_commit_ts("row.123").unwrap(), None);
        assert_eq!(ddl_file_commit_ts("ddl.1.tmp").unwrap(), None);

        // A ddl-shaped name with garbage suffix is fatal.
        assert!(ddl_file_commit_ts("ddl.notanumber").is_err());
    }

    #[test]
    fn test_ddl_listing_order_is_newest_first() {
        // Lexicographic order of the encoded names must equal reverse
        // commit-ts order for same-width suffixes.
        let older = format!("ddl.{}", u64::MAX - 100);
        let newer = format!("ddl.{}", u64::MAX - 200);
        assert!(newer < older);
    }

    #[test]
    fn test_row_file_name_decode() {
        assert_eq!(row_file_name("cdclog").unwrap(), Some(RowFileName::Bare));
        assert_eq!(
            row_file_name("cdclog.250").unwrap(),
            Some(RowFileName::LastTs(Timestamp(250)))
        );
        assert_eq!(row_file_name("index.250").unwrap(), None);
        assert!(row_file_name("cdclog.nan").is_err());
    }

    #[test]
    fn test_parse_quoted_name() {
        assert_eq!(
            parse_quoted_name("`db`.`orders`"),
            ("db".to_string(), "orders".to_string())
        );
        assert_eq!(
            parse_quoted_name("db.orders"),
            ("db".to_string(), "orders".to_string())
        );
        assert_eq!(
            parse_quoted_name("orders"),
            (String::new(), "orders".to_string())
        );
    }

    #[test]
    fn test_pick_tables_keeps_highest_id_per_name() {
        let mut meta = LogMeta::default();
        meta.names.insert(40, "`db`.`t1`".into());
        meta.names.insert(52, "`db`.`t1`".into()); // re-created under new id
        meta.names.insert(41, "`db`.`t2`".into());

        let picked = pick_tables(&meta, &TableFilter::all());
        assert_eq!(picked.len(), 2);
        let t1 = picked.iter().find(|t| t.table == "t1").unwrap();
        assert_eq!(t1.table_id, TableId(52));
        assert_eq!(t1.log_dir(), "t_52");
    }

    #[test]
    fn test_pick_tables_applies_filter() {
        let mut meta = LogMeta::default();
        meta.names.insert(1, "`db`.`keep`".into());
        meta.names.insert(2, "`db`.`skip`".into());

        let filter = TableFilter::new([("db".to_string(), "keep".to_string())]);
        let picked = pick_tables(&meta, &filter);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].table, "keep");
    }

    #[test]
    fn test_filter_wildcards() {
        let filter = TableFilter::new([("db".to_string(), "*".to_string())]);
        assert!(filter.matches("DB", "anything"));
        assert!(!filter.matches("other", "anything"));
        assert!(TableFilter::all().matches("x", "y"));
    }
}
