//! Collaborator seams toward the restore cluster: SQL execution, schema
//! catalog lookups, identifier allocators, the opaque single-row codec, and
//! the raw KV ingestion sink.
//!
//! Collaborators report failures as plain reason strings; the pipeline wraps
//! them into its own error taxonomy at the call site, where the statement,
//! table, or range context lives.

use std::collections::HashMap;
use std::sync::Arc;

use osprey_common::datum::Datum;
use osprey_common::error::RestoreResult;
use osprey_common::schema::TableDesc;
use osprey_common::types::{TableId, Timestamp};

use crate::codec::{KvPair, Range};

/// Executes replayed DDL statements against the cluster.
pub trait SqlExecutor: Send + Sync {
    fn execute(&self, statement: &str) -> Result<(), String>;
}

/// Read view of the restore cluster's schema, plus allocator access.
pub trait SchemaCatalog: Send + Sync {
    /// Refresh the cached schema snapshot after a DDL took effect.
    fn reload(&self) -> RestoreResult<()>;

    /// Current cluster timestamp, used when the caller leaves the window's
    /// upper bound open.
    fn current_ts(&self) -> RestoreResult<Timestamp>;

    fn table_by_id(&self, id: TableId) -> Option<TableDesc>;

    fn table_by_name(&self, schema: &str, table: &str) -> Option<TableDesc>;

    fn schema_exists(&self, schema: &str) -> bool;

    /// Identifier allocators bound to this table on the restore cluster.
    fn allocators(&self, table: &TableDesc) -> Allocators;
}

/// Which identifier sequence an allocator feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Hidden row id of tables without an integer primary-key handle.
    RowId,
    AutoIncrement,
    /// Incremental part of an AUTO_RANDOM handle.
    AutoRandom,
}

/// One identifier allocator. `rebase` raises the base to at least
/// `observed`; it never lowers it unless `force` is set.
pub trait IdAllocator: Send + Sync {
    fn rebase(&self, observed: i64, force: bool) -> Result<(), String>;
}

/// Allocator set for one table. Absent kinds are simply not rebased.
#[derive(Clone, Default)]
pub struct Allocators {
    map: HashMap<AllocatorKind, Arc<dyn IdAllocator>>,
}

impl Allocators {
    pub fn insert(&mut self, kind: AllocatorKind, alloc: Arc<dyn IdAllocator>) {
        self.map.insert(kind, alloc);
    }

    pub fn get(&self, kind: AllocatorKind) -> Option<&Arc<dyn IdAllocator>> {
        self.map.get(&kind)
    }
}

/// The cluster's single-row codec: turns a fully-materialized record into
/// its data and index pairs. Key layout is opaque to the pipeline beyond
/// the data/index marker byte.
pub trait TableCodec: Send + Sync {
    fn encode_record(
        &self,
        table: &TableDesc,
        record: &[Datum],
        row_id: i64,
    ) -> RestoreResult<Vec<KvPair>>;
}

/// Result of one `write_range` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole range was ingested.
    Complete,
    /// Keys before `resume_from` were ingested; the tail was not, typically
    /// because a region boundary moved mid-write.
    Partial { resume_from: Vec<u8> },
}

/// Raw KV ingestion sink. `pairs` is the sorted, deduplicated slice falling
/// inside `range`.
pub trait KvSink: Send + Sync {
    fn write_range(&self, range: &Range, pairs: &[KvPair]) -> Result<WriteOutcome, String>;
}
