//! Offline restore runner: replays a captured log directory against the
//! in-memory cluster stubs and reports what would be ingested. Useful for
//! validating a log capture and its statement registry before pointing the
//! pipeline at a live cluster.

mod args;

use std::collections::HashMap;
use std::fs;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use args::Args;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use osprey_common::config::{IngestRetryConfig, RestoreConfig};
use osprey_common::schema::TableDesc;
use osprey_common::types::Timestamp;
use osprey_restore::client::LogRestoreClient;
use osprey_restore::meta::TableFilter;
use osprey_restore::storage::LocalFsStorage;
use osprey_restore::stubs::{MemCluster, MemKvSink, SimpleTableCodec, StatementEffect};

/// Seed file for the offline cluster.
#[derive(Debug, Default, Deserialize)]
struct CatalogSeed {
    /// Tables that already exist when the replay starts.
    #[serde(default)]
    tables: Vec<TableDesc>,
    /// Statement text → catalog effect, for table-shaping DDL in the log.
    #[serde(default)]
    statements: HashMap<String, StatementEffect>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("osprey-restore: error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let cluster = Arc::new(MemCluster::new());
    if let Some(path) = &args.catalog {
        let data = fs::read(path).with_context(|| format!("reading catalog seed {}", path))?;
        let seed: CatalogSeed =
            serde_json::from_slice(&data).with_context(|| format!("parsing catalog seed {}", path))?;
        info!(
            tables = seed.tables.len(),
            statements = seed.statements.len(),
            "seeding offline cluster"
        );
        for table in seed.tables {
            cluster.add_table(table);
        }
        for (statement, effect) in seed.statements {
            cluster.register_ddl(&statement, effect);
        }
    }

    let filter = parse_filters(&args.filters)?;
    let config = RestoreConfig {
        concurrency: args.concurrency,
        ingest_concurrency: args.ingest_concurrency,
        batch_flush_pairs: args.batch_pairs,
        ingest_retry: IngestRetryConfig {
            max_rounds: args.max_ingest_rounds,
            ..IngestRetryConfig::default()
        },
        ..RestoreConfig::default()
    };

    let sink = Arc::new(MemKvSink::new());
    let client = LogRestoreClient::new(
        Arc::new(LocalFsStorage::new(args.input.as_str())),
        cluster.clone(),
        cluster,
        sink.clone(),
        Arc::new(SimpleTableCodec),
        config,
        Timestamp(args.start_ts),
        Timestamp(args.end_ts),
        filter,
    )
    .context("opening log directory")?;

    let (start, end) = client.window();
    info!(start_ts = start.0, end_ts = end.0, "replaying window");
    let summary = client.run().context("restore failed")?;

    println!("{}", summary);
    if args.dump_keys {
        for key in sink.keys() {
            println!("{}", hex(&key));
        }
    }
    Ok(())
}

fn parse_filters(rules: &[String]) -> Result<TableFilter> {
    let mut parsed = Vec::with_capacity(rules.len());
    for rule in rules {
        let Some((schema, table)) = rule.split_once('.') else {
            bail!("filter {:?} is not of the form schema.table", rule);
        };
        parsed.push((schema.to_string(), table.to_string()));
    }
    Ok(TableFilter::new(parsed))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
