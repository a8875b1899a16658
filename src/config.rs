use std::{num::NonZero, path::PathBuf};

use clap::Parser;
use humantime::Duration;

#[doc(hidden)]
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// File with the user-to-backend routes.
    /// Each line holds a username as its first field and the backend address as its last field,
    /// i.e. `alice 10.0.0.5:2222`. If the port is omitted, 22 is used.
    /// The file is reloaded when the process receives SIGHUP.
    #[arg(long, value_name = "FILE")]
    pub user_backend_file: PathBuf,

    /// Reject any load of the routes file with fewer entries than this.
    #[arg(long, default_value_t = 0, value_name = "COUNT")]
    pub user_backend_min_entries: usize,

    /// File with one IP address per line. Connections from these addresses are stalled
    /// and dropped without reaching SSH. The file is reloaded whenever it changes.
    #[arg(long, value_name = "FILE")]
    pub blacklist_file: Option<PathBuf>,

    /// File path to the server's secret key.
    #[arg(
        long,
        default_value_os = "/etc/ssh-reverse-proxy/id_rsa",
        value_name = "FILE"
    )]
    pub private_key_file: PathBuf,

    /// Address to listen for client connections.
    #[arg(long, default_value_t = String::from("0.0.0.0"), value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen for SSH connections.
    #[arg(long, default_value = "2222", value_name = "PORT")]
    pub ssh_port: NonZero<u16>,

    /// Time to wait before answering a failed authentication.
    #[arg(long, default_value = "5s", value_name = "DURATION")]
    pub auth_error_delay: Duration,

    /// Time until connections from blacklisted addresses get a canned response and are dropped.
    #[arg(long, default_value = "9500ms", value_name = "DURATION")]
    pub tarpit_timeout: Duration,

    /// Disconnect clients after this much time without activity.
    /// By default, idle connections are kept open.
    #[arg(long, value_name = "DURATION")]
    pub inactivity_timeout: Option<Duration>,

    /// Exit when a connection handler panics, instead of logging the panic and carrying on.
    #[arg(long, default_value_t = false)]
    pub exit_on_panic: bool,
}
