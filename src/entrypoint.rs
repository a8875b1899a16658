use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use color_eyre::eyre::Context;
use russh::{
    MethodKind, MethodSet, SshId, client,
    keys::decode_secret_key,
    server::Config,
};
use tokio::{
    fs,
    net::{TcpListener, TcpStream},
    pin,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ProxyServer,
    backends::{BackendDirectory, BackendResolver},
    blacklist::BlacklistWatcher,
    config::ApplicationConfig,
    droppable_handle::DroppableHandle,
    error::ServerError,
    fault::FaultReporter,
    ssh::{Server, ServerHandler},
    tarpit::Tarpit,
};

// Identification string sent to clients.
const SERVER_ID: &str = "SSH-2.0-SshReverseProxy";

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting SSH reverse proxy...");
    let key = fs::read_to_string(config.private_key_file.as_path())
        .await
        .with_context(|| "Error reading secret key")?;
    let key = decode_secret_key(&key, None).with_context(|| "Error decoding secret key")?;

    // Load the user routes, which are reloaded on SIGHUP.
    let backends = Arc::new(
        BackendDirectory::init(config.user_backend_file, config.user_backend_min_entries)
            .await
            .with_context(|| "Error loading user map")?,
    );
    info!(entries = backends.len(), "Successfully loaded user map.");
    #[cfg(unix)]
    let _reload_handle = reload_on_hangup(Arc::clone(&backends))?;

    // Listen on the blacklist file for updates, if one is set.
    let blacklist_watcher = match config.blacklist_file {
        Some(path) => Some(
            BlacklistWatcher::watch(path)
                .await
                .with_context(|| "Error setting up blacklist watcher")?,
        ),
        None => None,
    };
    let blacklist = blacklist_watcher
        .as_ref()
        .map(BlacklistWatcher::blacklist)
        .unwrap_or_default();
    let tarpit = Tarpit::builder()
        .drop_after(config.tarpit_timeout.into())
        .build();

    let mut server = Arc::new(ProxyServer {
        session_id: AtomicUsize::new(0),
        backends: Arc::clone(&backends) as Arc<dyn BackendResolver + Send + Sync>,
        upstream_config: Arc::new(client::Config::default()),
        auth_error_delay: config.auth_error_delay.into(),
    });
    let ssh_config = Arc::new(Config {
        inactivity_timeout: config.inactivity_timeout.map(Into::into),
        // The authentication hold-off is applied by the handler.
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        methods: MethodSet::from([MethodKind::Password].as_slice()),
        server_id: SshId::Standard(SERVER_ID.into()),
        keys: vec![key],
        ..Default::default()
    });

    let ssh_listener = TcpListener::bind((config.listen_address.as_str(), config.ssh_port.get()))
        .await
        .with_context(|| "Error listening to SSH port")?;
    info!("Listening for SSH connections on port {}.", config.ssh_port);
    // Connection tasks report their panics here when they must stop the server.
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<ServerError>();
    // Add OS signal handlers for termination.
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    let result = loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        continue;
                    },
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                let faults = FaultReporter::new(address, config.exit_on_panic, fault_tx.clone());
                if blacklist.contains(address.ip()) {
                    let tarpit = tarpit.clone();
                    supervise(faults, async move {
                        tarpit.handle(stream, address).await;
                    });
                } else {
                    let cancellation_token = CancellationToken::new();
                    let handler =
                        server.new_client(address, cancellation_token.clone(), faults.clone());
                    supervise(
                        faults.clone(),
                        handle_ssh_connection(HandleSshConnectionConfig {
                            stream,
                            address,
                            config: Arc::clone(&ssh_config),
                            handler,
                            cancellation_token,
                            faults,
                        }),
                    );
                }
            }
            _ = &mut signal_handler => {
                break Ok(());
            }
            Some(error) = fault_rx.recv() => {
                break Err(error.into());
            }
        }
    };
    info!("SSH reverse proxy is shutting down.");
    result
}

// Run the work for a connection in its own task, catching any panics at the task boundary.
fn supervise<F>(faults: FaultReporter, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let join_handle = tokio::spawn(work);
    tokio::spawn(async move {
        if let Err(error) = join_handle.await {
            faults.report_join_error(error);
        }
    });
}

struct HandleSshConnectionConfig {
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    handler: ServerHandler,
    cancellation_token: CancellationToken,
    faults: FaultReporter,
}

async fn handle_ssh_connection(
    HandleSshConnectionConfig {
        stream,
        address,
        config,
        handler,
        cancellation_token,
        faults,
    }: HandleSshConnectionConfig,
) {
    let mut session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(error) => {
            warn!(%error, %address, "Connection setup failed.");
            return;
        }
    };
    tokio::select! {
        result = &mut session => {
            match result {
                // A panic in the handler ends the session task, without keeping its payload.
                Err(russh::Error::Join(error)) => {
                    faults.report(format!("SSH session task failed: {error}"));
                }
                Err(error) => warn!(%error, %address, "Connection closed."),
                Ok(()) => (),
            }
        }
        _ = cancellation_token.cancelled() => {
            info!(%address, "Disconnecting client...");
            let _ = session.handle().disconnect(russh::Disconnect::ByApplication, "".into(), "English".into()).await;
        },
    }
}

// Reload the user routes whenever the process receives SIGHUP.
#[cfg(unix)]
fn reload_on_hangup(backends: Arc<BackendDirectory>) -> color_eyre::Result<DroppableHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_hangup =
        signal(SignalKind::hangup()).with_context(|| "Error listening to SIGHUP")?;
    Ok(DroppableHandle::spawn(async move {
        while signal_hangup.recv().await.is_some() {
            debug!("Received SIGHUP.");
            match backends.reload().await {
                Ok(entries) => info!(entries, "Successfully reloaded user map."),
                Err(error) => error!(%error, "Could not reload user map."),
            }
        }
    }))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
