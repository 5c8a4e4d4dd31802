// ===============================
// src/watcher.rs
// ===============================
use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Modified(PathBuf),
}

// Kecil saja: setiap event memicu baca ulang penuh, jadi event yang di-drop tidak hilang datanya.
pub const WATCHER_CHANNEL_CAPACITY: usize = 16;

/// Watch one file. Keep the returned watcher alive for as long as events are wanted.
pub fn watch_file(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<FileEvent>)> {
    let (event_tx, event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => handle_event(&event_tx, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default(),
    )
    .context("failed to create notify watcher")?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch path {}", path.display()))?;

    info!(path = %path.display(), "file watcher started");
    Ok((watcher, event_rx))
}

fn handle_event(event_tx: &mpsc::Sender<FileEvent>, event: Event) {
    if !matches!(event.kind, EventKind::Modify(_)) {
        return;
    }
    for path in event.paths {
        match event_tx.try_send(FileEvent::Modified(path)) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                debug!("watcher channel full; event coalesced");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("watcher channel closed; dropping file event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, ModifyKind};

    #[test]
    fn forwards_only_modify_events_and_coalesces_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let path = PathBuf::from("/var/log/nginx/access.log");

        handle_event(&tx, Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path.clone()));
        assert!(rx.try_recv().is_err());

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)));
        handle_event(&tx, modify.clone().add_path(path.clone()));
        handle_event(&tx, modify.add_path(path.clone()));

        assert_eq!(rx.try_recv().unwrap(), FileEvent::Modified(path));
        assert!(rx.try_recv().is_err());
    }
}
