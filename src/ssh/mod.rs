use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

mod relay;
mod request;
mod upstream;

use russh::{
    Channel, ChannelId, MethodKind, MethodSet, client,
    server::{Auth, Handler, Msg, Session},
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    ProxyServer,
    fault::FaultReporter,
    ssh::{
        relay::{ChannelRelay, UpstreamRequests},
        request::{ControlRequest, RequestPolicy},
        upstream::{UpstreamHandler, connect_upstream},
    },
};

// Shared data for each SSH connection.
pub(crate) struct ServerHandler {
    // The unique ID of this connection.
    id: usize,
    // The IP and port of this connection.
    peer: SocketAddr,
    // The username from this connection's authentication (set once authenticated).
    user: Option<String>,
    // Session with the backend server, only set by a successful authentication.
    upstream: Option<client::Handle<UpstreamHandler>>,
    // Forwarders to the upstream side of each open channel pair.
    channels: HashMap<ChannelId, UpstreamRequests>,
    // Token to communicate that this connection must be closed.
    cancellation_token: CancellationToken,
    // Where panics in this connection's tasks are reported.
    faults: FaultReporter,
    // Reference to the proxy data, for accessing configuration and services.
    server: Arc<ProxyServer>,
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
        faults: FaultReporter,
    ) -> ServerHandler;
}

impl Server for Arc<ProxyServer> {
    // Create a new handler for the SSH connection.
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
        faults: FaultReporter,
    ) -> ServerHandler {
        let id = self.session_id.fetch_add(1, Ordering::AcqRel);
        #[cfg(not(coverage_nightly))]
        tracing::info!(peer = %peer_address, id, "SSH client connected.");
        ServerHandler {
            id,
            peer: peer_address,
            user: None,
            upstream: None,
            channels: HashMap::new(),
            cancellation_token,
            faults,
            server: Arc::clone(self),
        }
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
        partial_success: false,
    }
}

impl ServerHandler {
    // Answer "not supported" to a request from the client.
    // russh only sends the failure if the client asked for a reply.
    fn decline(
        &self,
        channel: ChannelId,
        request: ControlRequest,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        if request.policy() == RequestPolicy::Decline {
            #[cfg(not(coverage_nightly))]
            tracing::debug!(peer = %self.peer, kind = request.kind(), "Ignoring unsupported request type.");
        }
        session.channel_failure(channel)
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Only password authentication can be relayed to the backend.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(reject())
    }

    // Authenticate against the user's backend with the same credentials.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, password), fields(peer = %self.peer, id = self.id), level = "debug")
    )]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some(backend) = self.server.backends.resolve(user) else {
            #[cfg(not(coverage_nightly))]
            tracing::info!(peer = %self.peer, %user, "Unknown user.");
            sleep(self.server.auth_error_delay).await;
            return Ok(reject());
        };
        let handler = UpstreamHandler::new(self.peer);
        let upstream_closed = handler.closed();
        match connect_upstream(
            Arc::clone(&self.server.upstream_config),
            &backend,
            user,
            password,
            handler,
        )
        .await
        {
            Ok(upstream) => {
                // Disconnect the client once the backend goes away.
                let cancellation_token = self.cancellation_token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = upstream_closed.cancelled() => cancellation_token.cancel(),
                        _ = cancellation_token.cancelled() => (),
                    }
                });
                self.user = Some(user.into());
                self.upstream = Some(upstream);
                #[cfg(not(coverage_nightly))]
                tracing::info!(peer = %self.peer, %user, %backend, "SSH client authenticated.");
                Ok(Auth::Accept)
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::info!(peer = %self.peer, %user, %backend, %error, "Could not authorize user.");
                sleep(self.server.auth_error_delay).await;
                Ok(reject())
            }
        }
    }

    // Pair each session channel with a new session channel on the backend.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, channel, session), fields(peer = %self.peer, id = self.id), level = "debug")
    )]
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(upstream) = self.upstream.as_ref() else {
            return Ok(false);
        };
        let upstream_channel = match upstream.channel_open_session().await {
            Ok(upstream_channel) => upstream_channel,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(peer = %self.peer, %error, "Unable to open upstream channel.");
                return Ok(false);
            }
        };
        let channel_id = channel.id();
        let relay = ChannelRelay::spawn(
            channel,
            session.handle(),
            upstream_channel,
            &self.cancellation_token,
            self.faults.clone(),
        );
        self.channels.insert(channel_id, relay.upstream_requests());
        let peer = self.peer;
        tokio::spawn(async move {
            relay.join().await;
            #[cfg(not(coverage_nightly))]
            tracing::debug!(%peer, ?channel_id, "Channel closed.");
        });
        Ok(true)
    }

    // Only subsystems are forwarded, and the client gets the backend's answer.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, session), fields(peer = %self.peer, id = self.id), level = "debug")
    )]
    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(requests) = self.channels.get(&channel).cloned() else {
            return session.channel_failure(channel);
        };
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, %name, "Forwarding subsystem request.");
        let request = ControlRequest::Subsystem {
            want_reply: true,
            name: name.into(),
        };
        let accepted = tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            accepted = requests.forward(request) => accepted,
        };
        if accepted {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(channel, ControlRequest::Env { want_reply: true }, session)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(
            channel,
            ControlRequest::Other {
                kind: "pty-req",
                want_reply: true,
            },
            session,
        )
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(
            channel,
            ControlRequest::Other {
                kind: "shell",
                want_reply: true,
            },
            session,
        )
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(
            channel,
            ControlRequest::Other {
                kind: "exec",
                want_reply: true,
            },
            session,
        )
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(
            channel,
            ControlRequest::Other {
                kind: "x11-req",
                want_reply: true,
            },
            session,
        )
    }

    // Never answered.
    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, kind = "window-change", "Ignoring unsupported request type.");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    // Connection-level forwarding is never relayed.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::info!(peer = %self.peer, %address, %port, "Rejecting remote forwarding request.");
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::info!(
            peer = %self.peer, host = %host_to_connect, port = %port_to_connect,
            "Rejecting local forwarding channel."
        );
        Ok(false)
    }
}

// Tear down the upstream session when the client disconnects.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        #[cfg(not(coverage_nightly))]
        tracing::info!(peer = %self.peer, %user, "SSH client disconnected.");
        if let Some(upstream) = self.upstream.take() {
            tokio::spawn(async move {
                let _ = upstream
                    .disconnect(russh::Disconnect::ByApplication, "", "English")
                    .await;
            });
        }
    }
}
