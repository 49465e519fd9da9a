//! Row-to-KV encoding: key-space types, the shard/auto-random row-id
//! transforms, and the `RowEncoder` that turns a captured row image into
//! key/value pairs via the storage client's opaque single-row codec.
//!
//! Encoded keys follow the `t | table-id(8) | _r/_i | suffix` layout; the
//! byte at `DATA_MARKER_OFFSET` classifies a pair as data or index.

use std::sync::Arc;

use osprey_common::datum::Datum;
use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::schema::TableDesc;
use osprey_common::types::TableId;

use crate::cluster::{AllocatorKind, Allocators, TableCodec};
use crate::event::RowEvent;

pub const TABLE_PREFIX: u8 = b't';
pub const TABLE_ID_LEN: usize = 8;
pub const RECORD_MARKER: &[u8; 2] = b"_r";
pub const INDEX_MARKER: &[u8; 2] = b"_i";
/// Offset of the `r`/`i` discriminator: `t`, 8 id bytes, `_` precede it.
pub const DATA_MARKER_OFFSET: usize = 1 + TABLE_ID_LEN + 1;

/// Name of the hidden row-id column a capture sink emits for tables whose
/// handle is not a declared primary-key column.
pub const HIDDEN_ROW_ID_COLUMN: &str = "_row_id";

/// An encoded key/value pair awaiting ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Comparable-encoded source row id, stored in the value's side channel
    /// for diagnostics. Never part of the sort key.
    pub row_id: Vec<u8>,
}

impl KvPair {
    pub fn is_data_key(&self) -> bool {
        self.key.get(DATA_MARKER_OFFSET) == Some(&b'r')
    }

    pub fn size(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// A covering interval over sorted keys awaiting ingestion; `end` is
/// exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Smallest key strictly greater than `key`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut succ = Vec::with_capacity(key.len() + 1);
    succ.extend_from_slice(key);
    succ.push(0);
    succ
}

/// 9-byte comparable encoding of a row id: a tag byte followed by the
/// sign-flipped big-endian value, so byte order equals numeric order.
pub fn encode_int_row_id(row_id: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(0x03);
    out.extend_from_slice(&((row_id as u64) ^ (1u64 << 63)).to_be_bytes());
    out
}

/// Record key prefix for a table: `t` + big-endian table id.
pub fn table_record_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + TABLE_ID_LEN + 2);
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&(table_id.0 as u64).to_be_bytes());
    key.extend_from_slice(RECORD_MARKER);
    key
}

/// Index key prefix for a table.
pub fn table_index_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + TABLE_ID_LEN + 2);
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&(table_id.0 as u64).to_be_bytes());
    key.extend_from_slice(INDEX_MARKER);
    key
}

/// Shard layout of an AUTO_RANDOM handle: the top `shard_bits` below the
/// sign bit hold the shard, the rest is the incremental part.
#[derive(Debug, Clone, Copy)]
pub struct ShardFormat {
    shard_bits: u8,
}

impl ShardFormat {
    pub fn new(shard_bits: u8) -> Self {
        debug_assert!(shard_bits < 63);
        Self { shard_bits }
    }

    pub fn incremental_mask(&self) -> i64 {
        (1i64 << (63 - self.shard_bits)) - 1
    }

    pub fn compose(&self, shard: i64, id: i64) -> i64 {
        let shard_part = (shard & ((1i64 << self.shard_bits) - 1)) << (63 - self.shard_bits);
        shard_part | (id & self.incremental_mask())
    }
}

/// Deterministic shard transform for hidden row ids of tables declaring
/// SHARD_ROW_ID_BITS: the shard is a hash of the id itself, so replay
/// reproduces the captured physical key.
pub fn shard_row_id(row_id: i64, shard_bits: u8) -> i64 {
    if shard_bits == 0 {
        return row_id;
    }
    let fmt = ShardFormat::new(shard_bits);
    let shard = splitmix64(row_id as u64) as i64;
    fmt.compose(shard, row_id)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Encodes row-change events for one resolved target table: casts captured
/// values, synthesizes missing ones, rebases identifier allocators, and
/// evaluates generated columns before handing the record to the opaque
/// single-row codec.
pub struct RowEncoder {
    table: Arc<TableDesc>,
    allocators: Allocators,
    codec: Arc<dyn TableCodec>,
    auto_random: Option<ShardFormat>,
}

impl RowEncoder {
    pub fn new(table: Arc<TableDesc>, allocators: Allocators, codec: Arc<dyn TableCodec>) -> Self {
        let auto_random = (table.auto_random_bits > 0)
            .then(|| ShardFormat::new(table.auto_random_bits));
        Self {
            table,
            allocators,
            codec,
            auto_random,
        }
    }

    pub fn table(&self) -> &Arc<TableDesc> {
        &self.table
    }

    /// Encode one captured row. `row_id_seed` feeds the deterministic
    /// transforms when the capture did not record an explicit handle.
    pub fn encode(&self, row: &RowEvent, row_id_seed: i64) -> RestoreResult<Vec<KvPair>> {
        let table = &*self.table;
        let mut record: Vec<Datum> = vec![Datum::Null; table.columns.len()];

        for col in &table.columns {
            let value = match row.columns.get(col.name.as_str()) {
                Some(captured) => {
                    let value = captured.cast(col.data_type).map_err(|reason| {
                        self.encoding_error(&col.name, reason)
                    })?;
                    if value.is_null() && !col.nullable {
                        return Err(self.encoding_error(
                            &col.name,
                            "null value for non-nullable column".to_string(),
                        ));
                    }
                    value
                }
                None => self.synthesize(col, row_id_seed)?,
            };

            if col.auto_random {
                let observed = value.as_i64().ok_or_else(|| {
                    self.encoding_error(&col.name, "auto-random column is not an integer".into())
                })?;
                let mask = self
                    .auto_random
                    .map(|f| f.incremental_mask())
                    .unwrap_or(i64::MAX);
                self.rebase(AllocatorKind::AutoRandom, observed & mask, &col.name)?;
            }
            if col.auto_increment {
                let observed = value.as_i64().ok_or_else(|| {
                    self.encoding_error(&col.name, "auto-increment column is not an integer".into())
                })?;
                self.rebase(AllocatorKind::AutoIncrement, observed, &col.name)?;
            }

            let slot = record.get_mut(col.offset).ok_or_else(|| {
                self.encoding_error(
                    &col.name,
                    format!("column offset {} out of range", col.offset),
                )
            })?;
            *slot = value;
        }

        let row_id = self.resolve_row_id(row, &record, row_id_seed)?;

        // Generated columns may reference earlier columns; ascending offset
        // order matches their evaluation order.
        for col in table.generated_columns() {
            let Some(expr) = col.generated.as_ref() else {
                continue;
            };
            let evaluated = expr
                .eval(&record)
                .and_then(|v| v.cast(col.data_type))
                .map_err(|reason| self.encoding_error(&col.name, reason))?;
            let slot = record.get_mut(col.offset).ok_or_else(|| {
                self.encoding_error(
                    &col.name,
                    format!("column offset {} out of range", col.offset),
                )
            })?;
            *slot = evaluated;
        }

        let mut pairs = self.codec.encode_record(table, &record, row_id)?;
        let encoded_row_id = encode_int_row_id(row_id);
        for pair in &mut pairs {
            pair.row_id = encoded_row_id.clone();
        }
        Ok(pairs)
    }

    /// Synthesize a value for a column absent from the captured image.
    fn synthesize(&self, col: &osprey_common::schema::ColumnDesc, row_id_seed: i64) -> RestoreResult<Datum> {
        if col.auto_increment {
            return Datum::Int64(row_id_seed)
                .cast(col.data_type)
                .map_err(|reason| self.encoding_error(&col.name, reason));
        }
        if col.auto_random {
            let fmt = self.auto_random.unwrap_or(ShardFormat::new(0));
            let composed = fmt.compose(splitmix64(row_id_seed as u64) as i64, row_id_seed);
            return Datum::Int64(composed)
                .cast(col.data_type)
                .map_err(|reason| self.encoding_error(&col.name, reason));
        }
        if col.generated.is_some() {
            // Overwritten after all captured columns are materialized.
            return Ok(Datum::placeholder(col.data_type));
        }
        if let Some(default) = &col.default_value {
            return Ok(default.clone());
        }
        if col.nullable {
            return Ok(Datum::Null);
        }
        Err(self.encoding_error(
            &col.name,
            "no captured value, default, or null allowed".to_string(),
        ))
    }

    /// Determine the row handle and rebase the row-id allocator so native
    /// writes after the restore never collide with replayed ids.
    fn resolve_row_id(
        &self,
        row: &RowEvent,
        record: &[Datum],
        row_id_seed: i64,
    ) -> RestoreResult<i64> {
        let table = &*self.table;
        if let Some(handle) = table.columns.iter().find(|c| c.is_handle) {
            let value = record.get(handle.offset).ok_or_else(|| {
                self.encoding_error(
                    &handle.name,
                    format!("column offset {} out of range", handle.offset),
                )
            })?;
            return value.as_i64().ok_or_else(|| {
                self.encoding_error(&handle.name, "handle column is not an integer".into())
            });
        }

        let row_id = match row.columns.get(HIDDEN_ROW_ID_COLUMN).and_then(Datum::as_i64) {
            Some(captured) => captured,
            None => shard_row_id(row_id_seed, table.shard_row_id_bits),
        };
        self.rebase(AllocatorKind::RowId, row_id, HIDDEN_ROW_ID_COLUMN)?;
        Ok(row_id)
    }

    fn rebase(&self, kind: AllocatorKind, observed: i64, column: &str) -> RestoreResult<()> {
        if let Some(alloc) = self.allocators.get(kind) {
            alloc
                .rebase(observed, false)
                .map_err(|reason| self.encoding_error(column, reason))?;
        }
        Ok(())
    }

    fn encoding_error(&self, column: &str, reason: String) -> RestoreError {
        RestoreError::Encoding {
            table: self.table.id,
            column: column.to_string(),
            reason,
        }
    }
}
