use std::time::Duration;

use clap::Parser;
use ssh_reverse_proxy::{ApplicationConfig, entrypoint};
use tokio::time::Instant;

use crate::common::{
    ProxyHandle, SERVER_KEY, TestBackend, connect_client, wait_for_port, write_temp_file,
};

/// This test ensures that unknown users and wrong passwords are rejected,
/// and that each rejection is held off for the configured delay.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_reject_invalid_credentials() {
    // 1. Initialize backend and proxy
    let backend = TestBackend::start("hunter2").await;
    let routes = write_temp_file("auth-routes", &backend.routes("alice"));
    let config = ApplicationConfig::parse_from([
        "ssh-reverse-proxy",
        "--user-backend-file",
        routes.to_str().unwrap(),
        "--private-key-file",
        SERVER_KEY,
        "--listen-address=127.0.0.1",
        "--ssh-port=18025",
        "--auth-error-delay=300ms",
    ]);
    let _proxy_handle = ProxyHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port(18025).await;

    // 2. Unknown user
    let start = Instant::now();
    let (_session, _replies, authenticated) = connect_client(18025, "mallory", "hunter2").await;
    assert!(!authenticated, "unknown user shouldn't authenticate");
    assert!(start.elapsed() >= Duration::from_millis(300));

    // 3. Known user with the wrong password
    let start = Instant::now();
    let (_session, _replies, authenticated) = connect_client(18025, "alice", "letmein").await;
    assert!(!authenticated, "wrong password shouldn't authenticate");
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(!backend.events().iter().any(|event| event.starts_with("auth:")));
}
