//! Per-table staging buffer: encoded pairs accumulate here between flushes,
//! and the current target-table binding (descriptor + allocators, as a
//! `RowEncoder`) lives here so a DDL can invalidate it mid-stream.

use std::sync::Arc;

use tracing::debug;

use osprey_common::config::RestoreConfig;
use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::schema::TableDesc;
use osprey_common::types::TableId;

use crate::cluster::{Allocators, TableCodec};
use crate::codec::{KvPair, RowEncoder};
use crate::event::RowEvent;
use crate::meta::TableSource;

pub struct TableBuffer {
    source: TableSource,
    /// Binding to the target table on the restore cluster. `None` until the
    /// table exists there, and again after a DROP TABLE replays.
    encoder: Option<RowEncoder>,
    pairs: Vec<KvPair>,
    size_bytes: u64,
    flush_pairs: usize,
    flush_bytes: u64,
    /// Seed for deterministic row-id synthesis when a capture omits the
    /// handle. Monotonic per buffer.
    row_seq: i64,
}

impl TableBuffer {
    pub fn new(source: TableSource, config: &RestoreConfig) -> Self {
        Self {
            source,
            encoder: None,
            pairs: Vec::new(),
            size_bytes: 0,
            flush_pairs: config.batch_flush_pairs,
            flush_bytes: config.batch_flush_bytes,
            row_seq: 0,
        }
    }

    pub fn source(&self) -> &TableSource {
        &self.source
    }

    pub fn is_resolved(&self) -> bool {
        self.encoder.is_some()
    }

    /// Target-side table id of the current binding, used to re-resolve after
    /// an in-place DDL.
    pub fn target_table_id(&self) -> Option<TableId> {
        self.encoder.as_ref().map(|e| e.table().id)
    }

    pub fn attach(
        &mut self,
        table: Arc<TableDesc>,
        allocators: Allocators,
        codec: Arc<dyn TableCodec>,
    ) {
        debug!(
            source = %self.source.table_id,
            target = %table.id,
            "bound table buffer to target"
        );
        self.encoder = Some(RowEncoder::new(table, allocators, codec));
    }

    /// Forget the target binding; the next row event forces a re-resolve.
    pub fn reset_target(&mut self) {
        self.encoder = None;
    }

    pub fn append_row(&mut self, row: &RowEvent) -> RestoreResult<()> {
        let encoder = self.encoder.as_ref().ok_or_else(|| {
            RestoreError::SchemaNotExists(format!("{}.{}", row.schema, row.table))
        })?;
        self.row_seq += 1;
        let pairs = encoder.encode(row, self.row_seq)?;
        for pair in &pairs {
            self.size_bytes += pair.size();
        }
        self.pairs.extend(pairs);
        Ok(())
    }

    pub fn should_flush(&self) -> bool {
        self.pairs.len() >= self.flush_pairs || self.size_bytes >= self.flush_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Hand the staged pairs to the caller and reset the accounting.
    pub fn take_pairs(&mut self) -> Vec<KvPair> {
        self.size_bytes = 0;
        std::mem::take(&mut self.pairs)
    }
}
