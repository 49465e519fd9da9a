//! In-memory collaborator implementations: a scriptable cluster (schema
//! catalog + SQL executor), a JSON-backed single-row codec, recording
//! allocators, and a KV sink with fault injection.
//!
//! These back the offline/dry-run mode of the CLI and the integration
//! tests; they model just enough cluster behavior to exercise the whole
//! pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use osprey_common::datum::Datum;
use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::schema::TableDesc;
use osprey_common::types::{TableId, Timestamp};

use crate::cluster::{
    AllocatorKind, Allocators, IdAllocator, KvSink, SchemaCatalog, SqlExecutor, TableCodec,
    WriteOutcome,
};
use crate::codec::{
    encode_int_row_id, table_index_prefix, table_record_prefix, KvPair, Range,
};

/// Allocator that remembers the highest rebase it has seen.
#[derive(Default)]
pub struct RecordingAllocator {
    high: Mutex<Option<i64>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water(&self) -> Option<i64> {
        *self.high.lock()
    }
}

impl IdAllocator for RecordingAllocator {
    fn rebase(&self, observed: i64, force: bool) -> Result<(), String> {
        let mut high = self.high.lock();
        *high = match (*high, force) {
            (_, true) | (None, _) => Some(observed),
            (Some(cur), false) => Some(cur.max(observed)),
        };
        Ok(())
    }
}

/// Single-row codec producing one JSON-valued data pair per record plus one
/// pair per declared index. Key layout matches the marker convention the
/// pipeline classifies by.
#[derive(Default)]
pub struct SimpleTableCodec;

impl TableCodec for SimpleTableCodec {
    fn encode_record(
        &self,
        table: &TableDesc,
        record: &[Datum],
        row_id: i64,
    ) -> RestoreResult<Vec<KvPair>> {
        let value = serde_json::to_vec(record).map_err(|e| RestoreError::Encoding {
            table: table.id,
            column: "*".into(),
            reason: e.to_string(),
        })?;
        let mut data_key = table_record_prefix(table.id);
        data_key.extend_from_slice(&encode_int_row_id(row_id));

        let mut pairs = Vec::with_capacity(1 + table.indexes.len());
        pairs.push(KvPair {
            key: data_key,
            value,
            row_id: Vec::new(),
        });

        for index in &table.indexes {
            let mut key = table_index_prefix(table.id);
            key.extend_from_slice(&(index.id as u64).to_be_bytes());
            for &offset in &index.column_offsets {
                let datum = record.get(offset).cloned().unwrap_or(Datum::Null);
                let encoded =
                    serde_json::to_vec(&datum).map_err(|e| RestoreError::Encoding {
                        table: table.id,
                        column: table
                            .columns
                            .get(offset)
                            .map(|c| c.name.clone())
                            .unwrap_or_default(),
                        reason: e.to_string(),
                    })?;
                key.push(0x00);
                key.extend_from_slice(&encoded);
            }
            if !index.unique {
                key.extend_from_slice(&encode_int_row_id(row_id));
            }
            pairs.push(KvPair {
                key,
                value: encode_int_row_id(row_id),
                row_id: Vec::new(),
            });
        }
        Ok(pairs)
    }
}

/// Effect a registered DDL statement has on the in-memory catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementEffect {
    /// Create the described table under a freshly assigned table id.
    Create(TableDesc),
    /// Replace the matching table's descriptor, keeping its id.
    Alter(TableDesc),
}

#[derive(Default)]
struct ClusterState {
    /// Lowercased schema names.
    schemas: HashSet<String>,
    /// (schema, table) lowercased → descriptor.
    tables: HashMap<(String, String), TableDesc>,
    registry: HashMap<String, StatementEffect>,
    current_schema: Option<String>,
    next_table_id: i64,
    reloads: u64,
}

/// In-memory restore cluster. Database-level statements and DROP/TRUNCATE
/// TABLE are parsed directly; table-shaping statements take effect through
/// a registry mapping exact statement text to a descriptor.
pub struct MemCluster {
    state: RwLock<ClusterState>,
    allocators: DashMap<(i64, AllocatorKind), Arc<RecordingAllocator>>,
    current_ts: AtomicU64,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self {
            state: RwLock::new(ClusterState {
                next_table_id: 100,
                ..ClusterState::default()
            }),
            allocators: DashMap::new(),
            current_ts: AtomicU64::new(1),
        }
    }
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_ts(&self, ts: u64) {
        self.current_ts.store(ts, Ordering::SeqCst);
    }

    pub fn add_schema(&self, name: &str) {
        self.state.write().schemas.insert(name.to_lowercase());
    }

    /// Install a pre-existing table, assigning it a fresh id.
    pub fn add_table(&self, mut desc: TableDesc) -> TableId {
        let mut state = self.state.write();
        let id = TableId(state.next_table_id);
        state.next_table_id += 1;
        desc.id = id;
        state.schemas.insert(desc.schema_name.to_lowercase());
        state.tables.insert(
            (desc.schema_name.to_lowercase(), desc.name.to_lowercase()),
            desc,
        );
        id
    }

    /// Teach the executor what a statement does.
    pub fn register_ddl(&self, statement: &str, effect: StatementEffect) {
        self.state
            .write()
            .registry
            .insert(statement.to_string(), effect);
    }

    pub fn reload_count(&self) -> u64 {
        self.state.read().reloads
    }

    /// Highest rebase recorded for a table's allocator, if any.
    pub fn high_water(&self, table: TableId, kind: AllocatorKind) -> Option<i64> {
        self.allocators
            .get(&(table.0, kind))
            .and_then(|alloc| alloc.high_water())
    }

    fn allocator(&self, table: TableId, kind: AllocatorKind) -> Arc<RecordingAllocator> {
        self.allocators
            .entry((table.0, kind))
            .or_insert_with(|| Arc::new(RecordingAllocator::new()))
            .clone()
    }
}

fn strip_name(token: &str) -> String {
    token
        .trim_end_matches(';')
        .trim_matches('`')
        .to_lowercase()
}

/// Split a possibly schema-qualified table name, falling back to the
/// executor's current schema.
fn qualify(token: &str, current: &Option<String>) -> Result<(String, String), String> {
    let token = token.trim_end_matches(';');
    if let Some((schema, table)) = token.split_once('.') {
        return Ok((strip_name(schema), strip_name(table)));
    }
    match current {
        Some(schema) => Ok((schema.clone(), strip_name(token))),
        None => Err(format!("no schema selected for table {}", token)),
    }
}

impl SqlExecutor for MemCluster {
    fn execute(&self, statement: &str) -> Result<(), String> {
        let trimmed = statement.trim();
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let verb = |i: usize| tokens.get(i).map(|t| t.to_uppercase()).unwrap_or_default();
        let mut state = self.state.write();

        match (verb(0).as_str(), verb(1).as_str()) {
            ("USE", _) if tokens.len() >= 2 => {
                let schema = strip_name(tokens[1]);
                if !state.schemas.contains(&schema) {
                    return Err(format!("unknown database {}", schema));
                }
                state.current_schema = Some(schema);
                Ok(())
            }
            ("CREATE", "DATABASE") | ("CREATE", "SCHEMA") => {
                let schema = strip_name(tokens.last().unwrap_or(&""));
                state.schemas.insert(schema);
                Ok(())
            }
            ("DROP", "DATABASE") | ("DROP", "SCHEMA") => {
                let schema = strip_name(tokens.last().unwrap_or(&""));
                if !state.schemas.remove(&schema) {
                    return Err(format!("unknown database {}", schema));
                }
                state.tables.retain(|(s, _), _| *s != schema);
                if state.current_schema.as_deref() == Some(schema.as_str()) {
                    state.current_schema = None;
                }
                Ok(())
            }
            ("DROP", "TABLE") if tokens.len() >= 3 => {
                let key = qualify(tokens[2], &state.current_schema)?;
                state
                    .tables
                    .remove(&key)
                    .map(|_| ())
                    .ok_or_else(|| format!("unknown table {}.{}", key.0, key.1))
            }
            ("TRUNCATE", "TABLE") if tokens.len() >= 3 => {
                // Truncation rotates the physical table id.
                let key = qualify(tokens[2], &state.current_schema)?;
                let new_id = TableId(state.next_table_id);
                state.next_table_id += 1;
                match state.tables.get_mut(&key) {
                    Some(desc) => {
                        desc.id = new_id;
                        Ok(())
                    }
                    None => Err(format!("unknown table {}.{}", key.0, key.1)),
                }
            }
            _ => {
                let Some(effect) = state.registry.get(trimmed).cloned() else {
                    return Err(format!("unsupported statement: {}", trimmed));
                };
                match effect {
                    StatementEffect::Create(mut desc) => {
                        if let Some(schema) = &state.current_schema {
                            desc.schema_name = schema.clone();
                        }
                        if !state.schemas.contains(&desc.schema_name.to_lowercase()) {
                            return Err(format!("unknown database {}", desc.schema_name));
                        }
                        desc.id = TableId(state.next_table_id);
                        state.next_table_id += 1;
                        debug!(table = %desc.id, name = %desc.name, "created table");
                        state.tables.insert(
                            (desc.schema_name.to_lowercase(), desc.name.to_lowercase()),
                            desc,
                        );
                        Ok(())
                    }
                    StatementEffect::Alter(mut desc) => {
                        if let Some(schema) = &state.current_schema {
                            desc.schema_name = schema.clone();
                        }
                        let key =
                            (desc.schema_name.to_lowercase(), desc.name.to_lowercase());
                        match state.tables.get_mut(&key) {
                            Some(existing) => {
                                desc.id = existing.id;
                                *existing = desc;
                                Ok(())
                            }
                            None => Err(format!("unknown table {}.{}", key.0, key.1)),
                        }
                    }
                }
            }
        }
    }
}

impl SchemaCatalog for MemCluster {
    fn reload(&self) -> RestoreResult<()> {
        self.state.write().reloads += 1;
        Ok(())
    }

    fn current_ts(&self) -> RestoreResult<Timestamp> {
        Ok(Timestamp(self.current_ts.load(Ordering::SeqCst)))
    }

    fn table_by_id(&self, id: TableId) -> Option<TableDesc> {
        self.state
            .read()
            .tables
            .values()
            .find(|t| t.id == id)
            .cloned()
    }

    fn table_by_name(&self, schema: &str, table: &str) -> Option<TableDesc> {
        self.state
            .read()
            .tables
            .get(&(schema.to_lowercase(), table.to_lowercase()))
            .cloned()
    }

    fn schema_exists(&self, schema: &str) -> bool {
        self.state.read().schemas.contains(&schema.to_lowercase())
    }

    fn allocators(&self, table: &TableDesc) -> Allocators {
        let mut out = Allocators::default();
        if table.has_auto_row_id() {
            out.insert(AllocatorKind::RowId, self.allocator(table.id, AllocatorKind::RowId));
        }
        if table.columns.iter().any(|c| c.auto_increment) {
            out.insert(
                AllocatorKind::AutoIncrement,
                self.allocator(table.id, AllocatorKind::AutoIncrement),
            );
        }
        if table.auto_random_column().is_some() {
            out.insert(
                AllocatorKind::AutoRandom,
                self.allocator(table.id, AllocatorKind::AutoRandom),
            );
        }
        out
    }
}

/// Sorted in-memory KV sink with fault injection for the retry loop.
#[derive(Default)]
pub struct MemKvSink {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    partial_failures: AtomicU32,
    hard_failures: AtomicU32,
}

impl MemKvSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes stop halfway through their batch.
    pub fn inject_partial_failures(&self, n: u32) {
        self.partial_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` writes fail outright.
    pub fn inject_hard_failures(&self, n: u32) {
        self.hard_failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.data.lock().keys().cloned().collect()
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvSink for MemKvSink {
    fn write_range(&self, _range: &Range, pairs: &[KvPair]) -> Result<WriteOutcome, String> {
        if Self::consume(&self.hard_failures) {
            return Err("injected sink failure".to_string());
        }
        if pairs.len() >= 2 && Self::consume(&self.partial_failures) {
            let split = pairs.len() / 2;
            let mut data = self.data.lock();
            for pair in &pairs[..split] {
                data.insert(pair.key.clone(), pair.value.clone());
            }
            return Ok(WriteOutcome::Partial {
                resume_from: pairs[split].key.clone(),
            });
        }
        let mut data = self.data.lock();
        for pair in pairs {
            data.insert(pair.key.clone(), pair.value.clone());
        }
        Ok(WriteOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_common::schema::{ColumnDesc, IndexDesc};
    use osprey_common::types::{ColumnId, DataType};

    fn table(schema: &str, name: &str) -> TableDesc {
        TableDesc {
            id: TableId(0),
            schema_name: schema.into(),
            name: name.into(),
            columns: vec![ColumnDesc {
                id: ColumnId(1),
                name: "id".into(),
                offset: 0,
                data_type: DataType::Int64,
                nullable: false,
                default_value: None,
                auto_increment: false,
                auto_random: false,
                generated: None,
                is_handle: true,
            }],
            auto_random_bits: 0,
            shard_row_id_bits: 0,
            indexes: vec![],
        }
    }

    #[test]
    fn test_recording_allocator_keeps_max() {
        let alloc = RecordingAllocator::new();
        alloc.rebase(10, false).unwrap();
        alloc.rebase(5, false).unwrap();
        assert_eq!(alloc.high_water(), Some(10));
        alloc.rebase(3, true).unwrap();
        assert_eq!(alloc.high_water(), Some(3));
    }

    #[test]
    fn test_executor_database_lifecycle() {
        let cluster = MemCluster::new();
        cluster.execute("CREATE DATABASE shop").unwrap();
        assert!(cluster.schema_exists("shop"));
        cluster.execute("USE shop").unwrap();
        assert!(cluster.execute("USE missing").is_err());
        cluster.execute("DROP DATABASE shop").unwrap();
        assert!(!cluster.schema_exists("shop"));
    }

    #[test]
    fn test_executor_create_via_registry_assigns_fresh_id() {
        let cluster = MemCluster::new();
        cluster.add_schema("shop");
        let stmt = "CREATE TABLE orders (id bigint primary key)";
        cluster.register_ddl(stmt, StatementEffect::Create(table("shop", "orders")));

        cluster.execute("USE shop").unwrap();
        cluster.execute(stmt).unwrap();
        let first = cluster.table_by_name("shop", "orders").unwrap().id;

        cluster.execute("DROP TABLE orders").unwrap();
        assert!(cluster.table_by_name("shop", "orders").is_none());

        cluster.execute(stmt).unwrap();
        let second = cluster.table_by_name("shop", "orders").unwrap().id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_executor_truncate_rotates_id() {
        let cluster = MemCluster::new();
        let id = cluster.add_table(table("shop", "orders"));
        cluster.execute("USE shop").unwrap();
        cluster.execute("TRUNCATE TABLE orders").unwrap();
        let after = cluster.table_by_name("shop", "orders").unwrap().id;
        assert_ne!(id, after);
        // Old id no longer resolves.
        assert!(cluster.table_by_id(id).is_none());
    }

    #[test]
    fn test_executor_alter_keeps_id() {
        let cluster = MemCluster::new();
        let id = cluster.add_table(table("shop", "orders"));
        let mut altered = table("shop", "orders");
        altered.columns.push(ColumnDesc {
            id: ColumnId(2),
            name: "note".into(),
            offset: 1,
            data_type: DataType::Text,
            nullable: true,
            default_value: None,
            auto_increment: false,
            auto_random: false,
            generated: None,
            is_handle: false,
        });
        let stmt = "ALTER TABLE orders ADD COLUMN note text";
        cluster.register_ddl(stmt, StatementEffect::Alter(altered));
        cluster.execute("USE shop").unwrap();
        cluster.execute(stmt).unwrap();
        let desc = cluster.table_by_name("shop", "orders").unwrap();
        assert_eq!(desc.id, id);
        assert_eq!(desc.columns.len(), 2);
    }

    #[test]
    fn test_executor_unknown_statement_is_error() {
        let cluster = MemCluster::new();
        assert!(cluster.execute("OPTIMIZE TABLE x").is_err());
    }

    #[test]
    fn test_codec_emits_index_pairs() {
        let mut desc = table("shop", "orders");
        desc.id = TableId(9);
        desc.indexes.push(IndexDesc {
            id: 1,
            name: "idx_id".into(),
            column_offsets: vec![0],
            unique: false,
        });
        let codec = SimpleTableCodec;
        let pairs = codec
            .encode_record(&desc, &[Datum::Int64(42)], 42)
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].is_data_key());
        assert!(!pairs[1].is_data_key());
    }

    #[test]
    fn test_sink_partial_injection() {
        let sink = MemKvSink::new();
        sink.inject_partial_failures(1);
        let pairs: Vec<KvPair> = (0..4u8)
            .map(|i| KvPair {
                key: vec![i],
                value: vec![i],
                row_id: vec![],
            })
            .collect();
        let range = Range {
            start: vec![0],
            end: vec![5],
        };
        match sink.write_range(&range, &pairs).unwrap() {
            WriteOutcome::Partial { resume_from } => assert_eq!(resume_from, vec![2]),
            other => panic!("expected partial outcome, got {:?}", other),
        }
        assert_eq!(sink.len(), 2);
        assert!(matches!(
            sink.write_range(&range, &pairs).unwrap(),
            WriteOutcome::Complete
        ));
        assert_eq!(sink.len(), 4);
    }
}
