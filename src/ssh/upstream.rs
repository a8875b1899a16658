use std::{net::SocketAddr, sync::Arc};

use russh::client;
use tokio_util::sync::CancellationToken;

use crate::{backends::Backend, error::ServerError};

// Client handler for the connection to a backend server.
pub(crate) struct UpstreamHandler {
    // The downstream client that this connection was made for.
    peer: SocketAddr,
    // Cancelled once the upstream session ends.
    closed: CancellationToken,
}

impl UpstreamHandler {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        UpstreamHandler {
            peer,
            closed: CancellationToken::new(),
        }
    }

    // Token that is cancelled when the upstream session ends, for any reason.
    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    // Backend host keys are not verified.
    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, "Upstream session ended.");
        self.closed.cancel();
    }
}

// Dial the backend and authenticate with the credentials given by the downstream client.
pub(crate) async fn connect_upstream(
    config: Arc<client::Config>,
    backend: &Backend,
    user: &str,
    password: &str,
    handler: UpstreamHandler,
) -> color_eyre::Result<client::Handle<UpstreamHandler>> {
    let mut handle = client::connect(config, (backend.host.as_str(), backend.port), handler).await?;
    if !handle
        .authenticate_password(user, password)
        .await?
        .success()
    {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        return Err(ServerError::UpstreamAuthenticationRejected.into());
    }
    Ok(handle)
}
