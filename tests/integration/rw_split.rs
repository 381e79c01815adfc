//! Read/write-split behavior against a live cluster

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_reads_spread_over_slaves() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        if let Some(id) = id {
            server_ids.insert(id);
        }
    }

    // With at least one slave configured the reads must leave the master
    eprintln!("reads observed on {} distinct servers", server_ids.len());
    assert!(!server_ids.is_empty());
}

#[test]
fn test_transaction_stays_on_one_server() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let first: Option<u64> = conn.query_first("SELECT @@server_id").unwrap();
    let second: Option<u64> = conn.query_first("SELECT @@server_id").unwrap();
    assert_eq!(first, second, "transaction must pin to one node");

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}

#[test]
fn test_session_variable_visible_after_read_split() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @hermes_it_probe = 17")
        .expect("SET should succeed");

    // The variable must be visible regardless of which backend answers
    for _ in 0..10 {
        let value: Option<u64> = conn
            .query_first("SELECT @hermes_it_probe")
            .expect("SELECT should succeed");
        assert_eq!(value, Some(17));
    }
}

#[test]
fn test_write_then_read_roundtrip() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop(
        "CREATE TABLE IF NOT EXISTS hermes_it (id INT PRIMARY KEY, v INT)",
    )
    .expect("CREATE TABLE should succeed");
    conn.query_drop("DELETE FROM hermes_it").unwrap();

    conn.query_drop("INSERT INTO hermes_it VALUES (1, 42)")
        .expect("INSERT should succeed");

    let value: Option<u64> = conn
        .query_first("SELECT v FROM hermes_it WHERE id = 1")
        .expect("SELECT should succeed");
    assert_eq!(value, Some(42));

    conn.query_drop("DELETE FROM hermes_it").unwrap();
}
