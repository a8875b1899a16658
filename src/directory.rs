use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::watch::{self, Receiver};

use crate::error::ServerError;

// Listen to events on a single file, and send relevant updates in a watch channel.
//
// The parent directory is watched instead of the file itself, so that the file may be
// created later or replaced by editors that rename over it.
pub(crate) fn watch_file<W: Watcher>(file: &Path) -> color_eyre::Result<(W, Receiver<()>)> {
    let file_name: OsString = file
        .file_name()
        .ok_or(ServerError::InvalidFilePath)?
        .to_owned();
    let directory = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let (tx, rx) = watch::channel(());
    let mut watcher = W::new(
        move |res: notify::Result<Event>| {
            if let Ok(res) = res {
                let is_relevant = res
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()));
                match res.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        if is_relevant =>
                    {
                        tx.send_replace(());
                    }
                    _ => (),
                }
            };
        },
        notify::Config::default().with_follow_symlinks(true),
    )?;
    watcher.watch(directory.as_path(), RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}
