use std::{net::SocketAddr, path::PathBuf};

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Invalid file path")]
    InvalidFilePath,
    #[error("Upstream server rejected the credentials")]
    UpstreamAuthenticationRejected,
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Request {0} cannot be forwarded")]
    UnforwardableRequest(&'static str),
    #[error("Connection from {peer} panicked: {message}")]
    ConnectionPanicked { peer: SocketAddr, message: String },
}

// Errors from (re)loading one of the runtime-reloadable tables.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Could not read file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("New map only contains {found} entries, which is less than the set minimum {minimum}")]
    TooFewEntries { found: usize, minimum: usize },
}
