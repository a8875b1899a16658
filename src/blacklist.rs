use std::{
    collections::HashSet,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use notify::RecommendedWatcher;
use tokio::{fs::read_to_string, sync::oneshot};

use crate::{directory::watch_file, droppable_handle::DroppableHandle, error::LoadError};

// Time to wait for further filesystem events before reloading.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

// Set of source addresses that must never reach the SSH server.
#[derive(Debug, Default)]
pub(crate) struct AddressBlacklist {
    addresses: RwLock<HashSet<IpAddr>>,
}

impl AddressBlacklist {
    // Parse the given file and replace the whole set with its contents.
    pub(crate) async fn reload(&self, path: &Path) -> Result<usize, LoadError> {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(?path, "Updating blacklist...");
        let contents = read_to_string(path)
            .await
            .map_err(|source| LoadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let addresses = parse_blacklist(&contents, path);
        let len = addresses.len();
        *self.addresses.write().unwrap() = addresses;
        #[cfg(not(coverage_nightly))]
        tracing::info!(?path, entries = len, "Blacklist updated.");
        Ok(len)
    }

    pub(crate) fn contains(&self, ip: IpAddr) -> bool {
        self.addresses.read().unwrap().contains(&ip.to_canonical())
    }
}

// One address per line. Anything after a `#` is a comment.
fn parse_blacklist(contents: &str, path: &Path) -> HashSet<IpAddr> {
    contents
        .lines()
        .map(|line| match line.split_once('#') {
            Some((address, _comment)) => address.trim(),
            None => line.trim(),
        })
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(?path, %line, %error, "Could not parse line from blacklist.");
                None
            }
        })
        .collect()
}

// Service that keeps an address blacklist in sync with a file.
#[derive(Debug)]
pub(crate) struct BlacklistWatcher {
    blacklist: Arc<AddressBlacklist>,
    // Task that reloads the blacklist upon filesystem changes.
    _join_handle: DroppableHandle<()>,
    // Filesystem change watcher.
    _watcher: RecommendedWatcher,
}

impl BlacklistWatcher {
    // Load the blacklist once, then reload it whenever the file changes.
    pub(crate) async fn watch(path: PathBuf) -> color_eyre::Result<Self> {
        let blacklist = Arc::new(AddressBlacklist::default());
        let (watcher, mut rx) = watch_file::<RecommendedWatcher>(path.as_path())?;
        let blacklist_clone = Arc::clone(&blacklist);
        let (init_tx, init_rx) = oneshot::channel::<()>();
        let join_handle = DroppableHandle::spawn(async move {
            let mut init_tx = Some(init_tx);
            loop {
                if init_tx.is_none() {
                    // Wait and debounce
                    loop {
                        if rx.changed().await.is_err() {
                            return;
                        }
                        tokio::time::sleep(RELOAD_DEBOUNCE).await;
                        let Ok(changed) = rx.has_changed() else {
                            return;
                        };
                        if !changed {
                            break;
                        }
                    }
                }
                // A failed load keeps the previous set, which is empty before the first success.
                if let Err(error) = blacklist_clone.reload(path.as_path()).await {
                    #[cfg(not(coverage_nightly))]
                    tracing::error!(%error, "Could not update blacklist.");
                }
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(());
                };
            }
        });
        // Wait until the blacklist has been loaded once
        init_rx.await?;
        Ok(BlacklistWatcher {
            blacklist,
            _join_handle: join_handle,
            _watcher: watcher,
        })
    }

    pub(crate) fn blacklist(&self) -> Arc<AddressBlacklist> {
        Arc::clone(&self.blacklist)
    }
}
