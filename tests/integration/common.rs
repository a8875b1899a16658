use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use russh::{
    Channel, ChannelId, CryptoVec, client,
    keys::load_secret_key,
    server::{self, Auth, Msg, Session},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};

pub(crate) const SERVER_KEY: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_keys/ssh");

// Exit status sent by the test backend when the client closes its input.
pub(crate) const BACKEND_EXIT_STATUS: u32 = 42;

// Subsystem that makes the test backend drop the connection.
pub(crate) const DISCONNECT_SUBSYSTEM: &str = "disconnect";

pub(crate) struct ProxyHandle(pub(crate) JoinHandle<color_eyre::Result<()>>);

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Write a routes or blacklist file for a single test.
pub(crate) fn write_temp_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "ssh-reverse-proxy-test-{}-{name}",
        std::process::id()
    ));
    std::fs::write(&path, contents).expect("Failed to write temporary file");
    path
}

pub(crate) async fn wait_for_port(port: u16) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the proxy to start.")
    };
}

// Things that the test backend observed, in order.
pub(crate) type BackendEvents = Arc<Mutex<Vec<String>>>;

// SSH server standing in for a backend host.
// It echoes data, accepts subsystems, and exits once the client sends EOF.
pub(crate) struct TestBackend {
    pub(crate) address: SocketAddr,
    pub(crate) events: BackendEvents,
    join_handle: JoinHandle<()>,
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

impl TestBackend {
    pub(crate) async fn start(password: &'static str) -> Self {
        let key = load_secret_key(SERVER_KEY, None).expect("Missing server key");
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![key],
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind backend");
        let address = listener.local_addr().unwrap();
        let events = BackendEvents::default();
        let join_handle = tokio::spawn({
            let events = Arc::clone(&events);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = BackendHandler {
                        password,
                        events: Arc::clone(&events),
                    };
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, stream, handler).await {
                            let _ = session.await;
                        }
                    });
                }
            }
        });
        TestBackend {
            address,
            events,
            join_handle,
        }
    }

    pub(crate) fn routes(&self, user: &str) -> String {
        format!("{user} {}\n", self.address)
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    // Wait until the backend records the given event.
    pub(crate) async fn wait_for_event(&self, event: &str) -> bool {
        timeout(Duration::from_secs(3), async {
            while !self.events().iter().any(|recorded| recorded == event) {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok()
    }
}

struct BackendHandler {
    password: &'static str,
    events: BackendEvents,
}

impl BackendHandler {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl server::Handler for BackendHandler {
    type Error = color_eyre::eyre::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == self.password {
            self.record(format!("auth:{user}"));
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.record("session");
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(format!("subsystem:{name}"));
        // Lets tests simulate a backend that goes away mid-session.
        if name == DISCONNECT_SUBSYSTEM {
            return Err(color_eyre::eyre::eyre!("Backend disconnected on request"));
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record("exec");
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(data))?;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record("eof");
        session.exit_status_request(channel, BACKEND_EXIT_STATUS)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

impl Drop for BackendHandler {
    fn drop(&mut self) {
        self.record("disconnected");
    }
}

// Answers to the requests sent by a test client.
pub(crate) type RequestReplies = mpsc::UnboundedReceiver<(ChannelId, bool)>;

pub(crate) struct SshClient(mpsc::UnboundedSender<(ChannelId, bool)>);

impl SshClient {
    pub(crate) fn new() -> (Self, RequestReplies) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SshClient(tx), rx)
    }
}

impl client::Handler for SshClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_success(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.0.send((channel, true));
        Ok(())
    }

    async fn channel_failure(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.0.send((channel, false));
        Ok(())
    }
}

// Connect to the proxy and log in, returning whether authentication succeeded.
pub(crate) async fn connect_client(
    port: u16,
    user: &str,
    password: &str,
) -> (client::Handle<SshClient>, RequestReplies, bool) {
    let (ssh_client, replies) = SshClient::new();
    let mut session = client::connect(Default::default(), ("127.0.0.1", port), ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    let authenticated = session
        .authenticate_password(user, password)
        .await
        .expect("SSH authentication failed")
        .success();
    (session, replies, authenticated)
}
