//! KILL dispatch across proxy workers

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_kill_connection_by_id() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut victim = config.conn();
    let mut killer = config.conn();

    let victim_id: Option<u64> = victim
        .query_first("SELECT CONNECTION_ID()")
        .expect("CONNECTION_ID should succeed");
    let victim_id = victim_id.expect("connection id");

    killer
        .query_drop(format!("KILL {victim_id}"))
        .expect("KILL should be accepted");

    // The victim's next statement must fail: its session is gone
    let result: Result<Option<u64>, _> = victim.query_first("SELECT 1");
    assert!(result.is_err(), "killed session should be closed");
}

#[test]
fn test_kill_query_leaves_session_open() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let my_id: Option<u64> = conn.query_first("SELECT CONNECTION_ID()").unwrap();
    let my_id = my_id.unwrap();

    let mut killer = config.conn();
    killer
        .query_drop(format!("KILL QUERY {my_id}"))
        .expect("KILL QUERY should be accepted");

    // With no query in flight the session survives
    let value: Option<u64> = conn.query_first("SELECT 1").expect("session stays usable");
    assert_eq!(value, Some(1));
}
