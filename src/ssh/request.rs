use russh::{Channel, ChannelId, ChannelMsg, server};

use crate::error::ServerError;

// Channel request received from either side of a channel pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlRequest {
    Subsystem { want_reply: bool, name: String },
    ExitStatus { exit_status: u32 },
    Env { want_reply: bool },
    // Any request kind that is never relayed.
    Other { kind: &'static str, want_reply: bool },
}

// What to do with a request coming from one side of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestPolicy {
    // Send it verbatim to the other side, relaying the reply if one is wanted.
    Forward,
    // Answer "not supported" without logging.
    DeclineQuietly,
    // Answer "not supported" and log it.
    Decline,
}

impl ControlRequest {
    // Returns None for messages that aren't channel requests (data, EOF, replies...).
    pub(crate) fn from_message(message: ChannelMsg) -> Option<Self> {
        let request = match message {
            ChannelMsg::RequestSubsystem { want_reply, name } => {
                ControlRequest::Subsystem { want_reply, name }
            }
            ChannelMsg::ExitStatus { exit_status } => ControlRequest::ExitStatus { exit_status },
            ChannelMsg::SetEnv { want_reply, .. } => ControlRequest::Env { want_reply },
            ChannelMsg::RequestPty { want_reply, .. } => ControlRequest::Other {
                kind: "pty-req",
                want_reply,
            },
            ChannelMsg::RequestShell { want_reply } => ControlRequest::Other {
                kind: "shell",
                want_reply,
            },
            ChannelMsg::Exec { want_reply, .. } => ControlRequest::Other {
                kind: "exec",
                want_reply,
            },
            ChannelMsg::RequestX11 { want_reply, .. } => ControlRequest::Other {
                kind: "x11-req",
                want_reply,
            },
            ChannelMsg::AgentForward { want_reply } => ControlRequest::Other {
                kind: "auth-agent-req@openssh.com",
                want_reply,
            },
            ChannelMsg::WindowChange { .. } => ControlRequest::Other {
                kind: "window-change",
                want_reply: false,
            },
            ChannelMsg::Signal { .. } => ControlRequest::Other {
                kind: "signal",
                want_reply: false,
            },
            ChannelMsg::ExitSignal { .. } => ControlRequest::Other {
                kind: "exit-signal",
                want_reply: false,
            },
            _ => return None,
        };
        Some(request)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlRequest::Subsystem { .. } => "subsystem",
            ControlRequest::ExitStatus { .. } => "exit-status",
            ControlRequest::Env { .. } => "env",
            ControlRequest::Other { kind, .. } => kind,
        }
    }

    pub(crate) fn want_reply(&self) -> bool {
        match self {
            ControlRequest::Subsystem { want_reply, .. }
            | ControlRequest::Env { want_reply, .. }
            | ControlRequest::Other { want_reply, .. } => *want_reply,
            ControlRequest::ExitStatus { .. } => false,
        }
    }

    pub(crate) fn policy(&self) -> RequestPolicy {
        match self {
            ControlRequest::Subsystem { .. } | ControlRequest::ExitStatus { .. } => {
                RequestPolicy::Forward
            }
            ControlRequest::Env { .. } => RequestPolicy::DeclineQuietly,
            ControlRequest::Other { .. } => RequestPolicy::Decline,
        }
    }

    // Send this request on a channel that we own (i.e. the upstream channel).
    pub(crate) async fn send_on_channel<S>(&self, channel: &Channel<S>) -> color_eyre::Result<()>
    where
        S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    {
        match self {
            ControlRequest::Subsystem { want_reply, name } => {
                channel.request_subsystem(*want_reply, name.as_str()).await?
            }
            ControlRequest::ExitStatus { exit_status } => channel.exit_status(*exit_status).await?,
            _ => return Err(ServerError::UnforwardableRequest(self.kind()).into()),
        }
        Ok(())
    }

    // Send this request to the downstream client through its session handle.
    pub(crate) async fn send_on_session(
        &self,
        handle: &server::Handle,
        id: ChannelId,
    ) -> color_eyre::Result<()> {
        match self {
            ControlRequest::ExitStatus { exit_status } => handle
                .exit_status_request(id, *exit_status)
                .await
                .map_err(|_| ServerError::ChannelClosed)?,
            _ => return Err(ServerError::UnforwardableRequest(self.kind()).into()),
        }
        Ok(())
    }
}

// Bytes read from a channel, keeping track of whether they belong to an extended stream (i.e. stderr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(bytes::Bytes),
    Extended(u32, bytes::Bytes),
}
