use std::{
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use russh::client;

use crate::backends::BackendResolver;

mod backends;
mod blacklist;
mod config;
mod directory;
mod droppable_handle;
mod entrypoint;
mod error;
mod fault;
mod ssh;
mod tarpit;

pub use config::ApplicationConfig;
pub use entrypoint::entrypoint;

// Data shared by every SSH connection.
pub(crate) struct ProxyServer {
    // Counter for assigning connection IDs.
    pub(crate) session_id: AtomicUsize,
    // Routes from usernames to backend servers.
    pub(crate) backends: Arc<dyn BackendResolver + Send + Sync>,
    // Configuration for the connections to backend servers.
    pub(crate) upstream_config: Arc<client::Config>,
    // Time to wait before rejecting a failed authentication.
    pub(crate) auth_error_delay: Duration,
}
