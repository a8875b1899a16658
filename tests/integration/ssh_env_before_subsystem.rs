use std::time::Duration;

use clap::Parser;
use ssh_reverse_proxy::{ApplicationConfig, entrypoint};
use tokio::time::timeout;

use crate::common::{
    ProxyHandle, SERVER_KEY, TestBackend, connect_client, wait_for_port, write_temp_file,
};

/// This test ensures that an environment variable sent without asking for a
/// reply (as sftp clients do) gets no answer, so that the answer to the
/// following subsystem request is the only one that the client sees.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_env_before_subsystem() {
    // 1. Initialize backend and proxy
    let backend = TestBackend::start("hunter2").await;
    let routes = write_temp_file("env-routes", &backend.routes("alice"));
    let config = ApplicationConfig::parse_from([
        "ssh-reverse-proxy",
        "--user-backend-file",
        routes.to_str().unwrap(),
        "--private-key-file",
        SERVER_KEY,
        "--listen-address=127.0.0.1",
        "--ssh-port=18032",
        "--auth-error-delay=100ms",
    ]);
    let _proxy_handle = ProxyHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port(18032).await;

    // 2. Send an environment variable, then request a subsystem right away
    let (session, mut replies, authenticated) = connect_client(18032, "alice", "hunter2").await;
    assert!(authenticated, "authentication didn't succeed");
    let channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .set_env(false, "LANG", "C")
        .await
        .expect("set_env failed");
    channel
        .request_subsystem(true, "sftp")
        .await
        .expect("request_subsystem failed");

    // 3. The only reply is the backend's success for the subsystem
    let Ok(Some((channel_id, success))) = timeout(Duration::from_secs(3), replies.recv()).await
    else {
        panic!("Timeout waiting for request reply.");
    };
    assert_eq!(channel_id, channel.id());
    assert!(success, "subsystem request got a failure reply");
    assert!(backend.wait_for_event("subsystem:sftp").await);
    assert!(
        timeout(Duration::from_millis(500), replies.recv())
            .await
            .is_err(),
        "client got an unexpected extra reply"
    );
}
