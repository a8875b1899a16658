use std::{
    collections::HashMap,
    fmt::Display,
    net::Ipv6Addr,
    path::{Path, PathBuf},
    sync::RwLock,
};

#[cfg(test)]
use mockall::automock;
use tokio::fs::read_to_string;

use crate::error::LoadError;

// Port used when a route doesn't specify one.
pub(crate) const DEFAULT_BACKEND_PORT: u16 = 22;

// Where a given user's sessions are sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Backend {
    // Hostname or IP address, without any brackets.
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// Lookup of the backend for a username.
#[cfg_attr(test, automock)]
pub(crate) trait BackendResolver {
    fn resolve(&self, user: &str) -> Option<Backend>;
}

// Username to backend routing table, loaded from a file and replaced as a whole on reload.
#[derive(Debug)]
pub(crate) struct BackendDirectory {
    // File that the routes are read from.
    path: PathBuf,
    // Reloads that yield fewer routes than this are rejected.
    min_entries: usize,
    routes: RwLock<HashMap<String, Backend>>,
}

impl BackendDirectory {
    // Load the routing table for the first time.
    pub(crate) async fn init(path: PathBuf, min_entries: usize) -> Result<Self, LoadError> {
        let directory = BackendDirectory {
            path,
            min_entries,
            routes: RwLock::new(HashMap::new()),
        };
        directory.reload().await?;
        Ok(directory)
    }

    // Re-read the routing file, swapping the table only if it has enough entries.
    pub(crate) async fn reload(&self) -> Result<usize, LoadError> {
        let contents = read_to_string(&self.path)
            .await
            .map_err(|source| LoadError::Read {
                path: self.path.clone(),
                source,
            })?;
        let routes = parse_routes(&contents, &self.path);
        let found = routes.len();
        if found < self.min_entries {
            return Err(LoadError::TooFewEntries {
                found,
                minimum: self.min_entries,
            });
        }
        *self.routes.write().unwrap() = routes;
        Ok(found)
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.read().unwrap().len()
    }
}

impl BackendResolver for BackendDirectory {
    fn resolve(&self, user: &str) -> Option<Backend> {
        self.routes.read().unwrap().get(user).cloned()
    }
}

// Each line is `user [anything...] host[:port]`. Later definitions override earlier ones.
fn parse_routes(contents: &str, path: &Path) -> HashMap<String, Backend> {
    let mut routes = HashMap::new();
    for (index, line) in contents.lines().enumerate() {
        let mut tokens = line.split_whitespace();
        let Some(user) = tokens.next() else {
            continue;
        };
        let host_spec = tokens.last().unwrap_or(user);
        let Some(backend) = parse_host_spec(host_spec) else {
            #[cfg(not(coverage_nightly))]
            tracing::warn!(?path, line = index + 1, %user, host = %host_spec, "Invalid backend address.");
            continue;
        };
        if routes.insert(user.to_string(), backend).is_some() {
            #[cfg(not(coverage_nightly))]
            tracing::info!(?path, line = index + 1, %user, "User was redefined.");
        }
    }
    routes
}

// Accepts `host`, `host:port`, `[ipv6]`, `[ipv6]:port`, or a bare IPv6 literal.
fn parse_host_spec(spec: &str) -> Option<Backend> {
    let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        match rest {
            "" => (host, None),
            _ => (host, Some(rest.strip_prefix(':')?)),
        }
    } else if spec.parse::<Ipv6Addr>().is_ok() {
        (spec, None)
    } else {
        match spec.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (spec, None),
        }
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(0) | Err(_) => return None,
            Ok(port) => port,
        },
        None => DEFAULT_BACKEND_PORT,
    };
    Some(Backend {
        host: host.to_string(),
        port,
    })
}
