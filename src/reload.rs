//! Access list hot reload.
//!
//! Watches the access list file and swaps the in-memory list wholesale
//! when it changes, so running connections keep matching against a
//! consistent snapshot.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use notify::{event::ModifyKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::access::{AccessList, AccessListConfig, AccessListError};

/// Editors save in several steps; wait for the burst to settle.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Reloads the file and swaps the list. A file that fails to load or
/// validate leaves the previous list in place.
pub fn apply_reload(path: &Path, access_list: &AccessList) -> Result<(), AccessListError> {
    let config = AccessListConfig::load(path)?;
    access_list.replace(&config)?;
    info!(
        "access list reloaded: {} domains, {} subnets",
        config.domains.len(),
        config.subnets.len()
    );
    Ok(())
}

/// Spawns the watcher thread. The watcher handle lives in the thread;
/// dropping nothing here keeps it alive for the process lifetime.
pub fn watch_access_list(
    path: PathBuf,
    access_list: Arc<AccessList>,
) -> Result<(), notify::Error> {
    let (tx, rx) = mpsc::channel::<()>();

    let file_name = path
        .canonicalize()
        .unwrap_or_else(|_| path.clone())
        .file_name()
        .map(PathBuf::from);

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(PathBuf::from) == file_name);
                // Direct writes show up as Modify, atomic saves as
                // Create after a rename.
                let relevant = matches!(
                    event.kind,
                    EventKind::Modify(ModifyKind::Data(_))
                        | EventKind::Modify(ModifyKind::Any)
                        | EventKind::Create(_)
                );
                if ours && relevant {
                    debug!("access list file changed: {:?}", event.paths);
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("access list watcher error: {}", e),
        })?;

    // Watch the directory so editors that replace the file are seen.
    let watch_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!("watching access list {}", path.display());

    thread::spawn(move || {
        let _watcher = watcher;
        while rx.recv().is_ok() {
            thread::sleep(DEBOUNCE);
            while rx.try_recv().is_ok() {}
            if let Err(e) = apply_reload(&path, &access_list) {
                warn!("access list reload failed, keeping previous: {}", e);
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tunsplit-reload-{}-{}", std::process::id(), name));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn reload_swaps_list() {
        let path = temp_file("swap.yaml", "domains:\n  - old.example\n");
        let config = AccessListConfig::load(&path).unwrap();
        let list = AccessList::new(&config).unwrap();
        assert!(list.match_domain("old.example"));

        fs::write(&path, "domains:\n  - new.example\n").unwrap();
        apply_reload(&path, &list).unwrap();
        assert!(!list.match_domain("old.example"));
        assert!(list.match_domain("new.example"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_reload_keeps_previous() {
        let path = temp_file("bad.yaml", "domains:\n  - keep.example\n");
        let config = AccessListConfig::load(&path).unwrap();
        let list = AccessList::new(&config).unwrap();

        fs::write(&path, "subnets:\n  - not-a-cidr\n").unwrap();
        assert!(apply_reload(&path, &list).is_err());
        assert!(list.match_domain("keep.example"));
        let _ = fs::remove_file(&path);
    }
}
