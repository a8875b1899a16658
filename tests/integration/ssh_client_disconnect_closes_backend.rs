use clap::Parser;
use russh::Disconnect;
use ssh_reverse_proxy::{ApplicationConfig, entrypoint};

use crate::common::{
    ProxyHandle, SERVER_KEY, TestBackend, connect_client, wait_for_port, write_temp_file,
};

/// This test ensures that the backend session is closed once the client
/// disconnects from the proxy.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_client_disconnect_closes_backend() {
    // 1. Initialize backend and proxy
    let backend = TestBackend::start("hunter2").await;
    let routes = write_temp_file("disconnect-routes", &backend.routes("alice"));
    let config = ApplicationConfig::parse_from([
        "ssh-reverse-proxy",
        "--user-backend-file",
        routes.to_str().unwrap(),
        "--private-key-file",
        SERVER_KEY,
        "--listen-address=127.0.0.1",
        "--ssh-port=18027",
        "--auth-error-delay=100ms",
    ]);
    let _proxy_handle = ProxyHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port(18027).await;

    // 2. Log in, open a session, then leave
    let (session, _replies, authenticated) = connect_client(18027, "alice", "hunter2").await;
    assert!(authenticated, "authentication didn't succeed");
    let _channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    assert!(backend.wait_for_event("session").await);
    session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
        .expect("disconnect failed");

    // 3. The backend sees its session end
    assert!(
        backend.wait_for_event("disconnected").await,
        "backend session wasn't closed"
    );
}
