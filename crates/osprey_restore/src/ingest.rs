//! Batch ingestion: sort, last-wins dedup, and the bounded retry loop that
//! drives partially-written sub-ranges to completion.
//!
//! One flush covers its batch with a single range, hands range writes to a
//! bounded pool of threads, and collects tails the sink could not finish
//! into a shared remainder list for the next round.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use osprey_common::cancel::CancelSignal;
use osprey_common::config::IngestRetryConfig;
use osprey_common::error::{RestoreError, RestoreResult};

use crate::checksum::KvChecksum;
use crate::cluster::{KvSink, WriteOutcome};
use crate::codec::{next_key, KvPair, Range};

/// Split a mixed batch into data and index pairs by the key marker,
/// accumulating a checksum for each class.
pub fn split_data_index(pairs: Vec<KvPair>) -> (ClassifiedPairs, ClassifiedPairs) {
    let mut data = ClassifiedPairs::default();
    let mut index = ClassifiedPairs::default();
    for pair in pairs {
        let class = if pair.is_data_key() { &mut data } else { &mut index };
        class.checksum.update_one(&pair);
        class.pairs.push(pair);
    }
    (data, index)
}

#[derive(Default)]
pub struct ClassifiedPairs {
    pub pairs: Vec<KvPair>,
    pub checksum: KvChecksum,
}

/// Sub-ranges still awaiting ingestion, shared across writer threads.
#[derive(Default)]
struct RemainingRanges {
    inner: Mutex<Vec<Range>>,
}

impl RemainingRanges {
    fn add(&self, range: Range) {
        self.inner.lock().push(range);
    }

    fn take(&self) -> Vec<Range> {
        std::mem::take(&mut *self.inner.lock())
    }
}

pub struct IngestWriter {
    sink: Arc<dyn KvSink>,
    concurrency: usize,
    retry: IngestRetryConfig,
    cancel: CancelSignal,
}

impl IngestWriter {
    pub fn new(
        sink: Arc<dyn KvSink>,
        concurrency: usize,
        retry: IngestRetryConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            sink,
            concurrency: concurrency.max(1),
            retry,
            cancel,
        }
    }

    /// Ingest one batch: stable sort by key, drop all but the last write to
    /// each key, then retry sub-ranges until nothing remains.
    pub fn write_rows(&self, mut pairs: Vec<KvPair>) -> RestoreResult<()> {
        if pairs.is_empty() {
            debug!("empty batch, nothing to ingest");
            return Ok(());
        }

        // Stable sort keeps event order within a key; the scan below keeps
        // only the final write.
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        let mut deduped: Vec<KvPair> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let duplicate = deduped.last().is_some_and(|last| last.key == pair.key);
            if duplicate {
                if let Some(last) = deduped.last_mut() {
                    *last = pair;
                }
            } else {
                deduped.push(pair);
            }
        }

        let covering = match (deduped.first(), deduped.last()) {
            (Some(first), Some(last)) => Range {
                start: first.key.clone(),
                end: next_key(&last.key),
            },
            _ => return Ok(()),
        };
        let remaining = RemainingRanges::default();
        remaining.add(covering);

        let mut round: u32 = 0;
        loop {
            self.cancel.check()?;
            let ranges = remaining.take();
            if ranges.is_empty() {
                return Ok(());
            }
            round += 1;
            if self.retry.max_rounds > 0 && round > self.retry.max_rounds {
                return Err(RestoreError::Ingestion(format!(
                    "batch not fully ingested after {} rounds, {} ranges left",
                    self.retry.max_rounds,
                    ranges.len()
                )));
            }
            if round > 1 {
                warn!(round, ranges = ranges.len(), "retrying unfinished sub-ranges");
                if self.cancel.sleep(self.retry.backoff_after(round - 1)) {
                    return Err(RestoreError::Cancelled);
                }
            }

            self.run_round(&deduped, ranges, &remaining)?;
        }
    }

    /// Write every range of one round, at most `concurrency` at a time.
    fn run_round(
        &self,
        pairs: &[KvPair],
        ranges: Vec<Range>,
        remaining: &RemainingRanges,
    ) -> RestoreResult<()> {
        let first_error: Mutex<Option<RestoreError>> = Mutex::new(None);
        let first_error = &first_error;
        for wave in ranges.chunks(self.concurrency) {
            std::thread::scope(|scope| {
                for range in wave {
                    scope.spawn(move || {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        if let Err(err) = self.write_one_range(pairs, range, remaining) {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                                self.cancel.cancel();
                            }
                        }
                    });
                }
            });
            if let Some(err) = first_error.lock().take() {
                return Err(err);
            }
            self.cancel.check()?;
        }
        Ok(())
    }

    fn write_one_range(
        &self,
        pairs: &[KvPair],
        range: &Range,
        remaining: &RemainingRanges,
    ) -> RestoreResult<()> {
        let lo = pairs.partition_point(|p| p.key < range.start);
        let hi = pairs.partition_point(|p| p.key < range.end);
        let slice = &pairs[lo..hi];
        if slice.is_empty() {
            return Ok(());
        }
        match self.sink.write_range(range, slice) {
            Ok(WriteOutcome::Complete) => Ok(()),
            Ok(WriteOutcome::Partial { resume_from }) => {
                debug!(pairs = slice.len(), "range partially written, requeueing tail");
                remaining.add(Range {
                    start: resume_from,
                    end: range.end.clone(),
                });
                Ok(())
            }
            Err(reason) => Err(RestoreError::Ingestion(reason)),
        }
    }
}
