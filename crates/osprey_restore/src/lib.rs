//! Log-based incremental restore pipeline.
//!
//! Replays a captured stream of schema-change (DDL) and row-change events,
//! bounded by a `[start_ts, end_ts]` window, into a live KV-backed storage
//! cluster:
//! - per-table event pulling with time-range filtering (`puller`)
//! - serialized DDL application against the shared schema catalog
//!   (`client`, guarded by a process-wide lock)
//! - row-to-KV encoding with allocator rebasing and generated-column
//!   evaluation (`codec`, `buffer`)
//! - range-based bulk ingestion with last-wins dedup and partial-failure
//!   retry (`ingest`)
//!
//! External collaborators (blob storage, SQL executor, schema catalog,
//! id allocators, single-row KV codec, cluster write path) are traits in
//! `storage` and `cluster`; `stubs` provides in-memory implementations for
//! tests and offline runs.

pub mod buffer;
pub mod checksum;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod event;
pub mod ingest;
pub mod meta;
pub mod puller;
pub mod storage;
pub mod stubs;
