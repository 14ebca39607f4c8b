// ABOUTME: In-process flow tests for ordered delivery and the filter pipeline
// ABOUTME: Exercises listener ordering guarantees without a live database

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use warp_pipe::changeset::{Changeset, ChangesetColumn, ChangesetKind, ColumnValue};
use warp_pipe::listener::wal2json::{parse_lsn, Wal2JsonMessage};
use warp_pipe::ordered::OrderedQueue;
use warp_pipe::pipeline::{ignore_tables, whitelist_tables, Pipeline};

fn changeset(id: i64, schema: &str, table: &str) -> Changeset {
    Changeset {
        id,
        kind: ChangesetKind::Insert,
        schema: schema.to_string(),
        table: table.to_string(),
        timestamp: Utc::now(),
        new_values: vec![ChangesetColumn {
            column: "id".to_string(),
            value: ColumnValue::Int(id),
            r#type: "int4".to_string(),
        }],
        old_values: vec![],
    }
}

#[test]
fn test_resume_after_gap_observes_each_id_once() {
    // A restart from id 42 must deliver 43..=100 exactly, even when the
    // notification buffer replays earlier ids after the backfill.
    let mut queue = OrderedQueue::new();
    let mut observed = Vec::new();

    // Backfill delivers 43..=80 in order.
    for id in 43..=80 {
        for change in queue.push(id, changeset(id, "public", "users")) {
            observed.push(change.id);
        }
    }
    // Buffered notifications replay 79..=82, then live delivery continues
    // out of order.
    for id in [79, 80, 81, 82, 85, 83, 84] {
        for change in queue.push(id, changeset(id, "public", "users")) {
            observed.push(change.id);
        }
    }
    for id in 86..=100 {
        for change in queue.push(id, changeset(id, "public", "users")) {
            observed.push(change.id);
        }
    }

    let expected: Vec<i64> = (43..=100).collect();
    assert_eq!(observed, expected);
}

#[test]
fn test_out_of_order_notifications_emit_in_order() {
    let mut queue = OrderedQueue::new();
    let mut observed = Vec::new();
    for id in [1, 2, 4, 5, 3] {
        for change in queue.push(id, changeset(id, "public", "users")) {
            observed.push(change.id);
        }
    }
    assert_eq!(observed, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_whitelist_and_ignore_filter_semantics() {
    // Whitelist [public.users, orders]: schema+table or bare table matches.
    // Ignore [public.*] afterwards: nothing in public survives.
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(
        "whitelist_tables",
        whitelist_tables(vec!["public.users".to_string(), "orders".to_string()]),
    );
    pipeline.add_stage("ignore_tables", ignore_tables(vec!["public.*".to_string()]));

    let (source_tx, source_rx) = mpsc::channel(16);
    let (err_tx, _err_rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut filtered = pipeline.start(source_rx, err_tx, &shutdown_tx);

    let inputs = vec![
        changeset(1, "public", "users"),   // whitelisted, then ignored by public.*
        changeset(2, "public", "orders"),  // bare-name whitelist, ignored by public.*
        changeset(3, "app", "orders"),     // bare-name whitelist, survives
        changeset(4, "app", "users"),      // not whitelisted
        changeset(5, "public", "logs"),    // not whitelisted
    ];
    for change in inputs {
        source_tx.send(change).await.unwrap();
    }
    drop(source_tx);

    let mut survivors = Vec::new();
    while let Some(change) = filtered.recv().await {
        survivors.push((change.schema, change.table));
    }
    assert_eq!(survivors, vec![("app".to_string(), "orders".to_string())]);
}

#[tokio::test]
async fn test_ordered_stream_survives_pipeline() {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(
        "whitelist_tables",
        whitelist_tables(vec!["public.*".to_string()]),
    );

    let (source_tx, source_rx) = mpsc::channel(16);
    let (err_tx, _err_rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut filtered = pipeline.start(source_rx, err_tx, &shutdown_tx);

    let feeder = tokio::spawn(async move {
        let mut queue = OrderedQueue::new();
        for id in [1, 2, 4, 5, 3, 6] {
            for change in queue.push(id, changeset(id, "public", "users")) {
                source_tx.send(change).await.unwrap();
            }
        }
    });

    let mut observed = Vec::new();
    while let Some(change) = filtered.recv().await {
        observed.push(change.id);
    }
    feeder.await.unwrap();
    assert_eq!(observed, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_replayed_wal_message_keeps_lsn_monotone() {
    let frame = r#"{
        "change": [{
            "kind": "insert",
            "schema": "public",
            "table": "users",
            "columnnames": ["id"],
            "columntypes": ["integer"],
            "columnvalues": [1]
        }],
        "nextlsn": "0/16D1918"
    }"#;

    let first = Wal2JsonMessage::decode(frame).unwrap();
    let mut repl_lsn = parse_lsn(first.nextlsn.as_deref().unwrap()).unwrap();
    let after_first = repl_lsn;

    // The same frame delivered again advances nothing.
    let second = Wal2JsonMessage::decode(frame).unwrap();
    repl_lsn = parse_lsn(second.nextlsn.as_deref().unwrap()).unwrap();

    assert_eq!(repl_lsn, after_first);
}
