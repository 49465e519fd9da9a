//! End-to-end replay scenarios over the in-memory collaborators: window
//! filtering, schema-drop fencing, drop/re-create id rotation, dedup, and
//! ingestion retry convergence.

use std::sync::Arc;

use osprey_common::config::RestoreConfig;
use osprey_common::error::RestoreError;
use osprey_common::schema::{ColumnDesc, IndexDesc, TableDesc};
use osprey_common::types::{ColumnId, DataType, TableId, Timestamp};

use osprey_restore::client::LogRestoreClient;
use osprey_restore::cluster::{AllocatorKind, SchemaCatalog};
use osprey_restore::codec::table_record_prefix;
use osprey_restore::meta::TableFilter;
use osprey_restore::storage::{LocalFsStorage, MemStorage};
use osprey_restore::stubs::{MemCluster, MemKvSink, SimpleTableCodec, StatementEffect};

fn orders_desc(with_index: bool) -> TableDesc {
    TableDesc {
        id: TableId(0),
        schema_name: "shop".into(),
        name: "orders".into(),
        columns: vec![
            ColumnDesc {
                id: ColumnId(1),
                name: "id".into(),
                offset: 0,
                data_type: DataType::Int64,
                nullable: false,
                default_value: None,
                auto_increment: true,
                auto_random: false,
                generated: None,
                is_handle: true,
            },
            ColumnDesc {
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
            },
        ],
        auto_random_bits: 0,
        shard_row_id_bits: 0,
        indexes: if with_index {
            vec![IndexDesc {
                id: 1,
                name: "idx_note".into(),
                column_offsets: vec![1],
                unique: false,
            }]
        } else {
            vec![]
        },
    }
}

fn meta_json(names: &[(i64, &str)], resolved: u64) -> String {
    let names = names
        .iter()
        .map(|(id, name)| format!(r#""{}":"{}""#, id, name))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"{{"names":{{{}}},"global_resolved_ts":{}}}"#,
        names, resolved
    )
}

fn ddl_json(ts: u64, schema: &str, table: &str, action: &str, query: &str) -> String {
    format!(
        r#"{{"kind":"ddl","commit_ts":{},"schema":"{}","table":"{}","action":"{}","query":"{}"}}"#,
        ts, schema, table, action, query
    )
}

fn row_json(ts: u64, schema: &str, table: &str, id: i64, note: &str) -> String {
    format!(
        r#"{{"kind":"row","commit_ts":{},"schema":"{}","table":"{}","columns":{{"id":{{"int64":{}}},"note":{{"text":"{}"}}}}}}"#,
        ts, schema, table, id, note
    )
}

fn ddl_file_name(ts: u64) -> String {
    format!("ddls/ddl.{}", u64::MAX - ts)
}

fn client(
    storage: Arc<MemStorage>,
    cluster: Arc<MemCluster>,
    sink: Arc<MemKvSink>,
    start: u64,
    end: u64,
) -> LogRestoreClient {
    LogRestoreClient::new(
        storage,
        cluster.clone(),
        cluster,
        sink,
        Arc::new(SimpleTableCodec),
        RestoreConfig::default(),
        Timestamp(start),
        Timestamp(end),
        TableFilter::all(),
    )
    .unwrap()
}

fn keys_with_prefix(sink: &MemKvSink, prefix: &[u8]) -> usize {
    sink.keys().iter().filter(|k| k.starts_with(prefix)).count()
}

#[test]
fn test_window_filters_rows() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    storage.put(
        "t_40/cdclog.250",
        [
            row_json(90, "shop", "orders", 1, "early"),
            row_json(150, "shop", "orders", 2, "inside"),
            row_json(250, "shop", "orders", 3, "late"),
        ]
        .join("\n"),
    );

    let cluster = Arc::new(MemCluster::new());
    let target = cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    let summary = client(storage, cluster, sink.clone(), 100, 200)
        .run()
        .unwrap();
    assert_eq!(summary.tables, 1);
    assert_eq!(summary.data.kvs(), 1);
    assert_eq!(keys_with_prefix(&sink, &table_record_prefix(target)), 1);
}

#[test]
fn test_ddl_creates_table_before_rows() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    let create = "CREATE TABLE orders (id bigint primary key, note text)";
    storage.put(
        &ddl_file_name(90),
        [
            ddl_json(80, "shop", "", "create_schema", "CREATE DATABASE shop"),
            ddl_json(90, "shop", "orders", "create_table", create),
        ]
        .join("\n"),
    );
    storage.put(
        "t_40/cdclog.150",
        [
            row_json(100, "shop", "orders", 1, "a"),
            row_json(150, "shop", "orders", 2, "b"),
        ]
        .join("\n"),
    );

    let cluster = Arc::new(MemCluster::new());
    cluster.register_ddl(create, StatementEffect::Create(orders_desc(true)));
    let sink = Arc::new(MemKvSink::new());

    let summary = client(storage, cluster.clone(), sink.clone(), 0, 1_000)
        .run()
        .unwrap();
    let target = cluster.table_by_name("shop", "orders").unwrap().id;
    assert_eq!(summary.data.kvs(), 2);
    assert_eq!(summary.index.kvs(), 2);
    assert_eq!(keys_with_prefix(&sink, &table_record_prefix(target)), 2);
    // Replayed ids rebased the auto-increment allocator.
    assert_eq!(
        cluster.high_water(target, AllocatorKind::AutoIncrement),
        Some(2)
    );
}

#[test]
fn test_schema_drop_fences_earlier_rows() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    let create = "CREATE TABLE orders (id bigint primary key, note text)";
    storage.put(
        &ddl_file_name(300),
        [
            ddl_json(10, "shop", "", "create_schema", "CREATE DATABASE shop"),
            ddl_json(20, "shop", "orders", "create_table", create),
            ddl_json(300, "shop", "", "drop_schema", "DROP DATABASE shop"),
        ]
        .join("\n"),
    );
    storage.put(
        "t_40/cdclog.200",
        [
            row_json(100, "shop", "orders", 1, "doomed"),
            row_json(200, "shop", "orders", 2, "doomed"),
        ]
        .join("\n"),
    );

    let cluster = Arc::new(MemCluster::new());
    cluster.register_ddl(create, StatementEffect::Create(orders_desc(false)));
    let sink = Arc::new(MemKvSink::new());

    let summary = client(storage, cluster.clone(), sink.clone(), 0, 1_000)
        .run()
        .unwrap();
    // Everything before the drop is obsolete; nothing reaches the sink.
    assert_eq!(summary.data.kvs(), 0);
    assert!(sink.is_empty());
    assert!(!cluster.schema_exists("shop"));
}

#[test]
fn test_drop_and_recreate_rotates_target_id() {
    let storage = Arc::new(MemStorage::new());
    // The name was dropped and re-created during capture; only the newer
    // backup-side id (52) is live and has a log directory.
    storage.put(
        "log.meta",
        meta_json(&[(40, "`shop`.`orders`"), (52, "`shop`.`orders`")], 1_000),
    );
    let create = "CREATE TABLE orders (id bigint primary key, note text)";
    storage.put(
        &ddl_file_name(130),
        [
            ddl_json(50, "shop", "orders", "create_table", create),
            ddl_json(120, "shop", "orders", "drop_table", "DROP TABLE orders"),
            ddl_json(130, "shop", "orders", "create_table", create),
        ]
        .join("\n"),
    );
    storage.put("t_52/cdclog.140", row_json(140, "shop", "orders", 7, "x"));

    let cluster = Arc::new(MemCluster::new());
    cluster.add_schema("shop");
    cluster.register_ddl(create, StatementEffect::Create(orders_desc(false)));
    let sink = Arc::new(MemKvSink::new());

    let summary = client(storage, cluster.clone(), sink.clone(), 0, 1_000)
        .run()
        .unwrap();
    assert_eq!(summary.tables, 1);
    assert_eq!(summary.data.kvs(), 1);
    let live = cluster.table_by_name("shop", "orders").unwrap().id;
    // The row resolved against the re-created table, not the dropped one.
    assert_eq!(keys_with_prefix(&sink, &table_record_prefix(live)), 1);
}

#[test]
fn test_last_write_to_a_key_wins() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    storage.put(
        "t_40/cdclog.110",
        [
            row_json(100, "shop", "orders", 1, "old"),
            row_json(110, "shop", "orders", 1, "new"),
        ]
        .join("\n"),
    );

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    client(storage, cluster, sink.clone(), 0, 1_000).run().unwrap();
    assert_eq!(sink.len(), 1);
    let value = sink.get(&sink.keys()[0]).unwrap();
    let record: Vec<osprey_common::datum::Datum> = serde_json::from_slice(&value).unwrap();
    assert_eq!(record[1], osprey_common::datum::Datum::Text("new".into()));
}

#[test]
fn test_ingestion_converges_under_partial_failures() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    let rows: Vec<String> = (0..60i64)
        .map(|i| row_json(100 + i as u64, "shop", "orders", i, "v"))
        .collect();
    storage.put("t_40/cdclog.200", rows.join("\n"));

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());
    sink.inject_partial_failures(5);

    let summary = client(storage, cluster, sink.clone(), 0, 1_000)
        .run()
        .unwrap();
    assert_eq!(summary.data.kvs(), 60);
    assert_eq!(sink.len(), 60);
}

#[test]
fn test_failed_ddl_aborts_restore() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    // The statement is never registered with the executor.
    storage.put(
        &ddl_file_name(50),
        ddl_json(50, "shop", "orders", "add_index", "CREATE INDEX i ON orders (note)"),
    );
    storage.put("t_40/cdclog.100", row_json(100, "shop", "orders", 1, "x"));

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    let err = client(storage, cluster, sink, 0, 1_000).run().unwrap_err();
    assert!(matches!(err, RestoreError::DdlExecution { .. }));
}

#[test]
fn test_unrelated_table_ddl_is_skipped() {
    let storage = Arc::new(MemStorage::new());
    storage.put("log.meta", meta_json(&[(40, "`shop`.`orders`")], 1_000));
    // DDL for a different table would fail if replayed by this worker.
    storage.put(
        &ddl_file_name(50),
        ddl_json(50, "shop", "carts", "create_table", "CREATE TABLE carts (id bigint)"),
    );
    storage.put("t_40/cdclog.100", row_json(100, "shop", "orders", 1, "x"));

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    let summary = client(storage, cluster, sink, 0, 1_000).run().unwrap();
    assert_eq!(summary.data.kvs(), 1);
}

#[test]
fn test_table_filter_limits_replay() {
    let storage = Arc::new(MemStorage::new());
    storage.put(
        "log.meta",
        meta_json(&[(40, "`shop`.`orders`"), (41, "`shop`.`carts`")], 1_000),
    );
    storage.put("t_40/cdclog.100", row_json(100, "shop", "orders", 1, "x"));
    storage.put("t_41/cdclog.100", row_json(100, "shop", "carts", 1, "x"));

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    let client = LogRestoreClient::new(
        storage,
        cluster.clone(),
        cluster,
        sink.clone(),
        Arc::new(SimpleTableCodec),
        RestoreConfig::default(),
        Timestamp(0),
        Timestamp(1_000),
        TableFilter::new([("shop".to_string(), "orders".to_string())]),
    )
    .unwrap();
    let summary = client.run().unwrap();
    assert_eq!(summary.tables, 1);
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_replay_from_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    osprey_restore::storage::write_local_file(
        root,
        "log.meta",
        meta_json(&[(40, "`shop`.`orders`")], 1_000).as_bytes(),
    )
    .unwrap();
    osprey_restore::storage::write_local_file(
        root,
        "t_40/cdclog.120",
        [
            row_json(100, "shop", "orders", 1, "a"),
            row_json(120, "shop", "orders", 2, "b"),
        ]
        .join("\n")
        .as_bytes(),
    )
    .unwrap();

    let cluster = Arc::new(MemCluster::new());
    cluster.add_table(orders_desc(false));
    let sink = Arc::new(MemKvSink::new());

    let client = LogRestoreClient::new(
        Arc::new(LocalFsStorage::new(root)),
        cluster.clone(),
        cluster,
        sink.clone(),
        Arc::new(SimpleTableCodec),
        RestoreConfig::default(),
        Timestamp(0),
        Timestamp(1_000),
        TableFilter::all(),
    )
    .unwrap();
    let summary = client.run().unwrap();
    assert_eq!(summary.data.kvs(), 2);
    assert_eq!(sink.len(), 2);
}
