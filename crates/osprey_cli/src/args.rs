use clap::Parser;

/// osprey-restore — replay a captured change log into a cluster
#[derive(Debug, Parser)]
#[command(
    name = "osprey-restore",
    about = "Replay captured DDL and row-change logs within a time window",
    version
)]
pub struct Args {
    /// Directory holding the captured log (log.meta, ddls/, t_<id>/)
    #[arg(short = 'i', long, value_name = "DIR")]
    pub input: String,

    /// Lower bound of the restore window (inclusive commit ts)
    #[arg(long, default_value_t = 0)]
    pub start_ts: u64,

    /// Upper bound of the restore window; 0 means "up to now"
    #[arg(long, default_value_t = 0)]
    pub end_ts: u64,

    /// Restrict replay to these tables (repeatable, schema.table, * allowed)
    #[arg(short = 'f', long = "filter", value_name = "SCHEMA.TABLE")]
    pub filters: Vec<String>,

    /// JSON file seeding the offline cluster: pre-existing tables and the
    /// statement registry
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<String>,

    /// Concurrent per-table workers
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Concurrent sub-range writers per flush
    #[arg(long, default_value_t = 16)]
    pub ingest_concurrency: usize,

    /// Flush a table buffer at this many pairs
    #[arg(long, default_value_t = 4096)]
    pub batch_pairs: usize,

    /// Give up on a batch after this many ingestion rounds (0 = unbounded)
    #[arg(long, default_value_t = 32)]
    pub max_ingest_rounds: u32,

    /// Print the ingested keys after the run
    #[arg(long)]
    pub dump_keys: bool,
}
