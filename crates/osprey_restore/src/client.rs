//! Restore orchestrator: validates the time window, replays database-level
//! DDL up front, then drives one worker per table through its merged event
//! stream.
//!
//! Table-level DDL is serialized through a process-wide lock because the
//! cluster's schema catalog is shared state; everything else runs in
//! parallel. The first worker to fail cancels the rest.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use osprey_common::cancel::CancelSignal;
use osprey_common::config::RestoreConfig;
use osprey_common::error::{RestoreError, RestoreResult};
use osprey_common::types::Timestamp;

use crate::buffer::TableBuffer;
use crate::checksum::KvChecksum;
use crate::cluster::{KvSink, SchemaCatalog, SqlExecutor, TableCodec};
use crate::event::{DdlAction, DdlEvent, LogRecord};
use crate::ingest::{split_data_index, IngestWriter};
use crate::meta::{
    ddl_file_commit_ts, pick_tables, row_file_name, LogMeta, RowFileName, TableFilter,
    TableSource, DDL_DIR, META_FILE,
};
use crate::puller::EventPuller;
use crate::storage::LogStorage;

/// Counters reported after a successful run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreSummary {
    pub tables: usize,
    pub data: KvChecksum,
    pub index: KvChecksum,
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tables={} data[{}] index[{}]",
            self.tables, self.data, self.index
        )
    }
}

struct TableJob {
    source: TableSource,
    puller: EventPuller,
    buffer: TableBuffer,
}

enum Resolution {
    Bound,
    /// The schema was dropped and never re-created; rows for it are
    /// obsolete.
    SchemaGone,
}

pub struct LogRestoreClient {
    storage: Arc<dyn LogStorage>,
    executor: Arc<dyn SqlExecutor>,
    catalog: Arc<dyn SchemaCatalog>,
    sink: Arc<dyn KvSink>,
    codec: Arc<dyn TableCodec>,
    config: RestoreConfig,
    meta: LogMeta,
    start_ts: Timestamp,
    end_ts: Timestamp,
    filter: TableFilter,
    /// Lowercased schema name → commit ts of its latest replayed drop.
    /// Events below the fence belong to tables that no longer exist.
    drop_fence: DashMap<String, u64>,
    ddl_lock: Mutex<()>,
    cancel: CancelSignal,
    data_sum: Mutex<KvChecksum>,
    index_sum: Mutex<KvChecksum>,
}

impl LogRestoreClient {
    /// Load the log metadata and validate the restore window. An `end_ts`
    /// of zero means "up to now" and resolves to the cluster's current ts;
    /// an upper bound beyond the log's resolved ts is clamped down to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn LogStorage>,
        executor: Arc<dyn SqlExecutor>,
        catalog: Arc<dyn SchemaCatalog>,
        sink: Arc<dyn KvSink>,
        codec: Arc<dyn TableCodec>,
        config: RestoreConfig,
        start_ts: Timestamp,
        end_ts: Timestamp,
        filter: TableFilter,
    ) -> RestoreResult<Self> {
        let data = storage.read(META_FILE)?;
        let meta = LogMeta::parse(&data, META_FILE)?;
        let resolved = meta.resolved_ts();

        let mut end_ts = if end_ts == Timestamp::ZERO {
            catalog.current_ts()?
        } else {
            end_ts
        };
        if start_ts > resolved {
            return Err(RestoreError::InvalidWindow {
                start_ts,
                resolved_ts: resolved,
            });
        }
        if end_ts > resolved {
            info!(
                end_ts = end_ts.0,
                resolved_ts = resolved.0,
                "clamping restore window to the log's resolved ts"
            );
            end_ts = resolved;
        }

        Ok(Self {
            storage,
            executor,
            catalog,
            sink,
            codec,
            config,
            meta,
            start_ts,
            end_ts,
            filter,
            drop_fence: DashMap::new(),
            ddl_lock: Mutex::new(()),
            cancel: CancelSignal::new(),
            data_sum: Mutex::new(KvChecksum::default()),
            index_sum: Mutex::new(KvChecksum::default()),
        })
    }

    pub fn window(&self) -> (Timestamp, Timestamp) {
        (self.start_ts, self.end_ts)
    }

    /// Signal observed by every worker; exposed so an embedding process can
    /// abort a running restore.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn run(&self) -> RestoreResult<RestoreSummary> {
        let ddl_files = self.collect_ddl_files()?;
        info!(files = ddl_files.len(), "replaying database-level ddl");
        self.apply_schema_ddl(&ddl_files)?;

        let sources = pick_tables(&self.meta, &self.filter);
        let mut jobs = Vec::with_capacity(sources.len());
        for source in sources {
            let row_files = self.collect_row_files(&source)?;
            debug!(
                table = %source.table_id,
                schema = %source.schema,
                name = %source.table,
                files = row_files.len(),
                "queueing table for replay"
            );
            jobs.push(TableJob {
                puller: EventPuller::new(self.storage.clone(), ddl_files.clone(), row_files),
                buffer: TableBuffer::new(source.clone(), &self.config),
                source,
            });
        }
        let tables = jobs.len();
        self.run_tables(jobs)?;

        let summary = RestoreSummary {
            tables,
            data: *self.data_sum.lock(),
            index: *self.index_sum.lock(),
        };
        info!(%summary, "restore finished");
        Ok(summary)
    }

    /// DDL file paths with commit ts inside the window's upper bound,
    /// oldest first. The listing comes back newest-first by construction of
    /// the file names.
    fn collect_ddl_files(&self) -> RestoreResult<Vec<String>> {
        let mut files = Vec::new();
        for entry in self.storage.list(DDL_DIR)? {
            let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            let Some(ts) = ddl_file_commit_ts(name)? else {
                continue;
            };
            if ts <= self.end_ts {
                files.push(entry.path);
            }
        }
        files.reverse();
        Ok(files)
    }

    /// Replay database-level DDL serially before any table worker starts,
    /// recording drop fences along the way.
    fn apply_schema_ddl(&self, ddl_files: &[String]) -> RestoreResult<()> {
        for file in ddl_files {
            let data = self.storage.read(file)?;
            for record in crate::event::decode_records(&data, file)? {
                let LogRecord::Ddl(event) = record else {
                    continue;
                };
                if !event.action.is_schema_level() {
                    continue;
                }
                if event.commit_ts < self.start_ts || event.commit_ts > self.end_ts {
                    continue;
                }
                info!(
                    schema = %event.schema,
                    ts = event.commit_ts.0,
                    "applying database-level ddl"
                );
                self.exec(&event.query)?;
                if event.action == DdlAction::DropSchema {
                    self.raise_fence(&event.schema, event.commit_ts);
                }
            }
        }
        Ok(())
    }

    /// Row-change files of one table whose contents can intersect the
    /// window, ordered oldest first with any bare-named file last.
    fn collect_row_files(&self, source: &TableSource) -> RestoreResult<Vec<String>> {
        let mut suffixed: Vec<(u64, String)> = Vec::new();
        let mut bare: Vec<String> = Vec::new();
        for entry in self.storage.list(&source.log_dir())? {
            let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            match row_file_name(name)? {
                None => continue,
                Some(RowFileName::Bare) => bare.push(entry.path),
                Some(RowFileName::LastTs(last)) => {
                    // The suffix is the file's *last* event ts; below the
                    // window start the whole file is out of range.
                    if last >= self.start_ts {
                        suffixed.push((last.0, entry.path));
                    }
                }
            }
        }
        suffixed.sort_by_key(|(ts, _)| *ts);
        let mut files: Vec<String> = suffixed.into_iter().map(|(_, path)| path).collect();
        files.extend(bare);
        Ok(files)
    }

    fn run_tables(&self, jobs: Vec<TableJob>) -> RestoreResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let workers = self.config.concurrency.max(1).min(jobs.len());
        let queue = Mutex::new(VecDeque::from(jobs));
        let first_error: Mutex<Option<RestoreError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    let Some(job) = queue.lock().pop_front() else {
                        return;
                    };
                    let source = job.source.clone();
                    if let Err(err) = self.restore_table(job) {
                        warn!(
                            table = %source.table_id,
                            schema = %source.schema,
                            name = %source.table,
                            error = %err,
                            "table replay failed"
                        );
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        self.cancel.cancel();
                    }
                });
            }
        });

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        self.cancel.check()
    }

    /// Replay one table's merged event stream to completion.
    fn restore_table(&self, job: TableJob) -> RestoreResult<()> {
        let TableJob {
            source,
            mut puller,
            mut buffer,
        } = job;

        loop {
            self.cancel.check()?;
            let Some(record) = puller.next_event()? else {
                break;
            };
            let ts = record.commit_ts();
            if ts < self.start_ts {
                continue;
            }
            if ts > self.end_ts {
                debug!(table = %source.table_id, ts = ts.0, "reached window end");
                break;
            }
            if self.fence_blocks(record.schema(), ts) {
                // Anything staged targets a table doomed by a later drop.
                self.flush(&mut buffer)?;
                continue;
            }
            match record {
                LogRecord::Ddl(event) => {
                    self.apply_table_ddl(&source, &mut buffer, &event)?;
                }
                LogRecord::Row(row) => {
                    if !buffer.is_resolved() {
                        match self.resolve_target(&mut buffer, &row.schema, &row.table)? {
                            Resolution::Bound => {}
                            Resolution::SchemaGone => {
                                debug!(
                                    schema = %row.schema,
                                    table = %row.table,
                                    "discarding row for dropped schema"
                                );
                                continue;
                            }
                        }
                    }
                    buffer.append_row(&row)?;
                    if buffer.should_flush() {
                        self.flush(&mut buffer)?;
                    }
                }
            }
        }
        self.flush(&mut buffer)
    }

    /// Handle one DDL event inside a table worker. Schema-level events were
    /// already applied up front and only refresh the drop fence here.
    fn apply_table_ddl(
        &self,
        source: &TableSource,
        buffer: &mut TableBuffer,
        event: &DdlEvent,
    ) -> RestoreResult<()> {
        if !event.schema.eq_ignore_ascii_case(&source.schema) {
            return Ok(());
        }
        if event.action.is_schema_level() {
            if event.action == DdlAction::DropSchema {
                self.raise_fence(&event.schema, event.commit_ts);
            }
            return Ok(());
        }
        if !event.table.eq_ignore_ascii_case(&source.table) {
            return Ok(());
        }

        // Staged rows were encoded against the pre-DDL descriptor.
        self.flush(buffer)?;

        info!(
            schema = %event.schema,
            table = %event.table,
            ts = event.commit_ts.0,
            action = ?event.action,
            "replaying table ddl"
        );
        {
            let _guard = self.ddl_lock.lock();
            self.exec(&format!("USE {}", event.schema))?;
            self.exec(&event.query)?;
        }

        if event.action.is_drop_table() {
            buffer.reset_target();
            return Ok(());
        }
        match self.resolve_target(buffer, &event.schema, &event.table)? {
            Resolution::Bound => Ok(()),
            Resolution::SchemaGone => Err(RestoreError::SchemaNotExists(event.schema.clone())),
        }
    }

    /// Re-bind a buffer to its target table: by current target id first (an
    /// in-place DDL keeps the id), then by name (drop/re-create and
    /// truncate rotate it).
    fn resolve_target(
        &self,
        buffer: &mut TableBuffer,
        schema: &str,
        table: &str,
    ) -> RestoreResult<Resolution> {
        self.catalog.reload()?;

        if let Some(id) = buffer.target_table_id() {
            if let Some(desc) = self.catalog.table_by_id(id) {
                self.bind(buffer, desc);
                return Ok(Resolution::Bound);
            }
        }
        if let Some(desc) = self.catalog.table_by_name(schema, table) {
            self.bind(buffer, desc);
            return Ok(Resolution::Bound);
        }
        if !self.catalog.schema_exists(schema) {
            return Ok(Resolution::SchemaGone);
        }
        Err(RestoreError::SchemaNotExists(format!("{}.{}", schema, table)))
    }

    fn bind(&self, buffer: &mut TableBuffer, desc: osprey_common::schema::TableDesc) {
        let allocators = self.catalog.allocators(&desc);
        buffer.attach(Arc::new(desc), allocators, self.codec.clone());
    }

    /// Ingest everything a buffer holds. Flushing an empty buffer is a
    /// no-op, so callers flush freely at stream boundaries.
    fn flush(&self, buffer: &mut TableBuffer) -> RestoreResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let pairs = buffer.take_pairs();
        debug!(
            table = %buffer.source().table_id,
            pairs = pairs.len(),
            "flushing table buffer"
        );
        let (data, index) = split_data_index(pairs);
        let writer = IngestWriter::new(
            self.sink.clone(),
            self.config.ingest_concurrency,
            self.config.ingest_retry.clone(),
            self.cancel.clone(),
        );
        writer.write_rows(data.pairs)?;
        writer.write_rows(index.pairs)?;
        self.data_sum.lock().merge(&data.checksum);
        self.index_sum.lock().merge(&index.checksum);
        Ok(())
    }

    fn exec(&self, statement: &str) -> RestoreResult<()> {
        self.executor
            .execute(statement)
            .map_err(|reason| RestoreError::DdlExecution {
                statement: statement.to_string(),
                reason,
            })
    }

    fn raise_fence(&self, schema: &str, ts: Timestamp) {
        self.drop_fence
            .entry(schema.to_lowercase())
            .and_modify(|fence| *fence = (*fence).max(ts.0))
            .or_insert(ts.0);
    }

    fn fence_blocks(&self, schema: &str, ts: Timestamp) -> bool {
        self.drop_fence
            .get(&schema.to_lowercase())
            .map_or(false, |fence| *fence > ts.0)
    }
}
