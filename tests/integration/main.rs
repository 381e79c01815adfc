//! Integration test entry point
//!
//! These run against a live proxy in front of a real replication cluster.
//! Run with: HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod kill;
mod rw_split;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration testing is enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("skipped: set HERMES_RUN_INTEGRATION_TESTS=1 to run");
            return;
        }
    };
}

/// Proxy endpoint configuration from the environment
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "app".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

impl ProxyTestConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    pub fn conn(&self) -> mysql::PooledConn {
        let pool = mysql::Pool::new(self.url().as_str()).expect("proxy should be reachable");
        pool.get_conn().expect("connection should succeed")
    }
}
