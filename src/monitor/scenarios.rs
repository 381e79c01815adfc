//! Monitor behavior against live mock backends

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::{status_flags, BackendAuth, ServerDescriptor};
use crate::cluster::Cluster;
use crate::testutil::{master_responder, slave_responder, MockBackend, MockReply};

use super::{ClusterMonitor, MonitorConfig};

fn server_for(name: &str, mock: &MockBackend) -> Arc<ServerDescriptor> {
    ServerDescriptor::new(name, "127.0.0.1", mock.addr.port(), 1)
}

fn auth() -> BackendAuth {
    BackendAuth {
        user: "hermes".into(),
        password: String::new(),
    }
}

#[tokio::test]
async fn test_tick_derives_roles_from_probes() {
    let master_mock = MockBackend::with_responder(master_responder(1)).await;
    let slave_mock = MockBackend::with_responder(slave_responder(2, master_mock.addr)).await;

    let master = server_for("A", &master_mock);
    let slave = server_for("B", &slave_mock);
    let cluster = Cluster::new("main", vec![master.clone(), slave.clone()]);

    let (_tx, rx) = mpsc::channel(4);
    let mut monitor = ClusterMonitor::new(cluster.clone(), MonitorConfig::default(), auth(), rx);

    monitor.tick().await;

    assert!(master.is_master(), "A should be derived master");
    assert!(slave.is_slave(), "B should be derived slave");
    assert_eq!(cluster.master().unwrap().name, "A");
    assert_eq!(slave.replication_lag(), 0);
    assert_eq!(master.node_id(), 1);
}

#[tokio::test]
async fn test_master_loss_marks_down_after_probes() {
    let master_mock = MockBackend::with_responder(master_responder(1)).await;
    let slave_mock = MockBackend::with_responder(slave_responder(2, master_mock.addr)).await;

    let master = server_for("A", &master_mock);
    let slave = server_for("B", &slave_mock);
    let cluster = Cluster::new("main", vec![master.clone(), slave.clone()]);

    let (_tx, rx) = mpsc::channel(4);
    let mut monitor = ClusterMonitor::new(
        cluster.clone(),
        MonitorConfig {
            failcount: 3,
            auto_failover: false,
            connect_timeout_ms: 200,
            ..Default::default()
        },
        auth(),
        rx,
    );

    monitor.tick().await;
    assert!(master.is_master());

    master_mock.kill();
    monitor.tick().await;

    assert!(!master.is_running(), "dead master should be Down");
    assert!(cluster.master().is_none());
}

#[tokio::test]
async fn test_automatic_failover_promotes_slave() {
    let master_mock = MockBackend::with_responder(master_responder(1)).await;
    let master_addr = master_mock.addr;
    let slave_mock = MockBackend::with_responder(slave_responder(2, master_addr)).await;

    let master = server_for("A", &master_mock);
    let slave = server_for("B", &slave_mock);
    let cluster = Cluster::new("main", vec![master.clone(), slave.clone()]);

    let (_tx, rx) = mpsc::channel(4);
    let mut monitor = ClusterMonitor::new(
        cluster.clone(),
        MonitorConfig {
            failcount: 2,
            auto_failover: true,
            verify_master_failure: true,
            failover_timeout_secs: 5,
            connect_timeout_ms: 200,
            ..Default::default()
        },
        auth(),
        rx,
    );

    monitor.tick().await;
    assert_eq!(cluster.master().unwrap().name, "A");

    // The master dies; the slave's IO thread loses its connection, which is
    // what confirms the failure to the monitor. Once the promotion clears
    // read_only the node reports as a writable replication root.
    master_mock.kill();
    let promoted_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = promoted_flag.clone();
    slave_mock.set_responder(move |sql| {
        use std::sync::atomic::Ordering;
        let upper = sql.trim().to_uppercase();
        if upper.starts_with("SET GLOBAL READ_ONLY=0") {
            flag.store(true, Ordering::Relaxed);
            return MockReply::ok();
        }
        let promoted = flag.load(Ordering::Relaxed);
        if upper.starts_with("SHOW SLAVE STATUS") {
            let columns = vec![
                "Master_Host".into(),
                "Master_Port".into(),
                "Slave_IO_Running".into(),
                "Slave_SQL_Running".into(),
                "Seconds_Behind_Master".into(),
            ];
            if promoted {
                return MockReply::Rows {
                    columns,
                    rows: Vec::new(),
                };
            }
            return MockReply::Rows {
                columns,
                rows: vec![vec![
                    master_addr.ip().to_string(),
                    master_addr.port().to_string(),
                    "No".into(),
                    "Yes".into(),
                    "0".into(),
                ]],
            };
        }
        if upper.starts_with("SELECT @@SERVER_ID") {
            return MockReply::Rows {
                columns: vec!["@@server_id".into(), "@@read_only".into()],
                rows: vec![vec![
                    "2".into(),
                    if promoted { "0" } else { "1" }.into(),
                ]],
            };
        }
        if upper.starts_with("SELECT @@GTID_CURRENT_POS") {
            return MockReply::single_row("@@gtid_current_pos", "0-1-10");
        }
        MockReply::ok()
    });

    // failcount=2 consecutive unreachable ticks trigger the failover
    monitor.tick().await;
    monitor.tick().await;

    tokio::time::timeout(Duration::from_secs(10), async {
        while !slave.is_master() {
            tokio::time::sleep(Duration::from_millis(50)).await;
            monitor.tick().await;
        }
    })
    .await
    .expect("slave should be promoted");

    // The promotion sequence ran on the candidate
    let promoted = slave_mock.received();
    assert!(promoted.contains(&"STOP SLAVE".to_string()));
    assert!(promoted.contains(&"RESET SLAVE ALL".to_string()));
    assert!(promoted.contains(&"SET GLOBAL read_only=0".to_string()));

    assert!(slave.status() & status_flags::MASTER != 0);
}

#[tokio::test]
async fn test_rejoin_refuses_divergent_standalone_master() {
    let master_mock = MockBackend::with_responder(master_responder(1)).await;
    // A standalone writable node with events the cluster never saw
    let stray_mock = MockBackend::with_responder(|sql| {
        let upper = sql.trim().to_uppercase();
        if upper.starts_with("SELECT @@SERVER_ID") {
            return MockReply::Rows {
                columns: vec!["@@server_id".into(), "@@read_only".into()],
                rows: vec![vec!["3".into(), "0".into()]],
            };
        }
        if upper.starts_with("SHOW SLAVE STATUS") {
            return MockReply::empty_result(&["Master_Host"]);
        }
        if upper.starts_with("SELECT @@GTID_CURRENT_POS") {
            // Domain 5 is unknown to the cluster master
            return MockReply::single_row("@@gtid_current_pos", "5-3-100");
        }
        MockReply::ok()
    })
    .await;

    let master = server_for("A", &master_mock);
    let stray = server_for("C", &stray_mock);
    let cluster = Cluster::new("main", vec![master.clone(), stray.clone()]);

    let (_tx, rx) = mpsc::channel(4);
    let mut monitor = ClusterMonitor::new(
        cluster.clone(),
        MonitorConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        },
        auth(),
        rx,
    );

    monitor.tick().await;
    assert_eq!(cluster.master().unwrap().name, "A");

    let result = monitor.rejoin("C").await;
    assert!(result.is_err(), "divergent standalone master must be refused");
    assert!(result.unwrap_err().contains("local events"));
}

#[tokio::test]
async fn test_rejoin_repoints_node_to_current_master() {
    let master_mock = MockBackend::with_responder(master_responder(1)).await;
    // A returning read-only node still pointed at a long-gone old master
    let returning_mock = MockBackend::with_responder(|sql| {
        let upper = sql.trim().to_uppercase();
        if upper.starts_with("SELECT @@SERVER_ID") {
            return MockReply::Rows {
                columns: vec!["@@server_id".into(), "@@read_only".into()],
                rows: vec![vec!["4".into(), "1".into()]],
            };
        }
        if upper.starts_with("SHOW SLAVE STATUS") {
            return MockReply::Rows {
                columns: vec![
                    "Master_Host".into(),
                    "Master_Port".into(),
                    "Slave_IO_Running".into(),
                    "Slave_SQL_Running".into(),
                    "Seconds_Behind_Master".into(),
                ],
                rows: vec![vec![
                    "10.99.99.99".into(),
                    "3306".into(),
                    "No".into(),
                    "Yes".into(),
                    "0".into(),
                ]],
            };
        }
        if upper.starts_with("SELECT @@GTID_CURRENT_POS") {
            return MockReply::single_row("@@gtid_current_pos", "0-1-5");
        }
        MockReply::ok()
    })
    .await;

    let master = server_for("A", &master_mock);
    let returning = server_for("D", &returning_mock);
    let cluster = Cluster::new("main", vec![master.clone(), returning.clone()]);

    let (_tx, rx) = mpsc::channel(4);
    let mut monitor = ClusterMonitor::new(
        cluster.clone(),
        MonitorConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        },
        auth(),
        rx,
    );

    monitor.tick().await;
    monitor.rejoin("D").await.expect("rejoin should succeed");

    let received = returning_mock.received();
    assert!(received.iter().any(|q| q.starts_with("CHANGE MASTER TO")));
    assert!(received.contains(&"START SLAVE".to_string()));
    let change = received
        .iter()
        .find(|q| q.starts_with("CHANGE MASTER TO"))
        .unwrap();
    assert!(change.contains(&format!("MASTER_PORT={}", master_mock.addr.port())));
}
