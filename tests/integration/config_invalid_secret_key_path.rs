use std::time::Duration;

use clap::Parser;
use ssh_reverse_proxy::{ApplicationConfig, entrypoint};
use tokio::time::timeout;

use crate::common::write_temp_file;

/// This test ensures that an invalid secret key path results in an error when
/// launching the proxy.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn config_invalid_secret_key_path() {
    // 1. Fail to initialize proxy
    let routes = write_temp_file("invalid-key-routes", "alice 127.0.0.1\n");
    let config = ApplicationConfig::parse_from([
        "ssh-reverse-proxy",
        "--user-backend-file",
        routes.to_str().unwrap(),
        "--private-key-file",
        "/",
        "--listen-address=127.0.0.1",
        "--ssh-port=18028",
    ]);
    if timeout(Duration::from_secs(5), async {
        assert!(entrypoint(config).await.is_err());
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the proxy to start.")
    };
}
