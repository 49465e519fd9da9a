//! Per-table event puller: a lazy, finite, non-restartable merge of the
//! table's row-change files and the window-filtered DDL files into one
//! commit-ts-ordered event sequence.
//!
//! Files are read one at a time as either side's buffer runs dry, so the
//! only suspension point is blocking file I/O. Exhaustion is `Ok(None)`,
//! not an error. On equal timestamps the DDL event wins, so a CREATE TABLE
//! and its first row at the same ts replay in a usable order.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use osprey_common::error::RestoreResult;

use crate::event::{decode_records, LogRecord};
use crate::storage::LogStorage;

pub struct EventPuller {
    storage: Arc<dyn LogStorage>,
    /// DDL file paths, oldest first.
    ddl_files: VecDeque<String>,
    /// Row-change file paths in listing order (bare `cdclog` last).
    row_files: VecDeque<String>,
    ddl_buf: VecDeque<LogRecord>,
    row_buf: VecDeque<LogRecord>,
}

impl EventPuller {
    pub fn new(
        storage: Arc<dyn LogStorage>,
        ddl_files: Vec<String>,
        row_files: Vec<String>,
    ) -> Self {
        Self {
            storage,
            ddl_files: ddl_files.into(),
            row_files: row_files.into(),
            ddl_buf: VecDeque::new(),
            row_buf: VecDeque::new(),
        }
    }

    /// Pull the next event in commit-ts order, or `None` once both sides
    /// are exhausted.
    pub fn next_event(&mut self) -> RestoreResult<Option<LogRecord>> {
        self.refill(Side::Ddl)?;
        self.refill(Side::Row)?;

        let take_ddl = match (self.ddl_buf.front(), self.row_buf.front()) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(d), Some(r)) => d.commit_ts() <= r.commit_ts(),
        };
        let record = if take_ddl {
            self.ddl_buf.pop_front()
        } else {
            self.row_buf.pop_front()
        };
        Ok(record)
    }

    fn refill(&mut self, side: Side) -> RestoreResult<()> {
        loop {
            let (buf, files) = match side {
                Side::Ddl => (&mut self.ddl_buf, &mut self.ddl_files),
                Side::Row => (&mut self.row_buf, &mut self.row_files),
            };
            if !buf.is_empty() {
                return Ok(());
            }
            let Some(path) = files.pop_front() else {
                return Ok(());
            };
            debug!(file = %path, "loading log file");
            let data = self.storage.read(&path)?;
            let records = decode_records(&data, &path)?;
            buf.extend(records);
            // A file can legitimately be empty; move on to the next one.
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Ddl,
    Row,
}
