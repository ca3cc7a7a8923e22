//! `notify`-backed watch backend.
//!
//! Every file gets its own non-recursive watch and a small integer handle.
//! `notify` delivers events on its own thread; `poll` waits for the first
//! relevant one and then drains whatever else is queued, so a single
//! wake-up reports a whole burst.

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Change, WatchBackend, WatchEvent};
use crate::error::WatchError;

pub struct NotifyBackend {
    watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    handles: HashMap<PathBuf, i32>,
    paths: HashMap<i32, PathBuf>,
    next_handle: i32,
}

impl NotifyBackend {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, events) = mpsc::channel::<notify::Result<Event>>();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(WatchError::Unavailable)?;

        Ok(Self {
            watcher,
            events,
            handles: HashMap::new(),
            paths: HashMap::new(),
            next_handle: 1,
        })
    }

    fn forget(&mut self, path: &Path) -> Option<i32> {
        let handle = self.handles.remove(path)?;
        self.paths.remove(&handle);
        Some(handle)
    }

    fn translate(&mut self, received: notify::Result<Event>, out: &mut Vec<WatchEvent>) {
        let event = match received {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "notification error");
                return;
            }
        };

        if event.need_rescan() {
            out.push(WatchEvent {
                handle: None,
                path: None,
                change: Change::Overflow,
            });
            return;
        }

        let Some(change) = classify(&event.kind) else {
            return;
        };
        for path in event.paths {
            let handle = match change {
                // The OS dropped the watch along with the file
                Change::Removed => self.forget(&path),
                _ => self.handles.get(&path).copied(),
            };
            out.push(WatchEvent {
                handle,
                path: Some(path),
                change,
            });
        }
    }
}

/// Content changes only; opens, reads and attribute updates are dropped.
fn classify(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => Some(Change::Removed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) | EventKind::Create(_) => Some(Change::Modified),
        _ => None,
    }
}

impl WatchBackend for NotifyBackend {
    fn add_watch(&mut self, path: &Path) -> Result<i32, WatchError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::AddWatch {
                path: path.to_path_buf(),
                source,
            })?;

        self.forget(path);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(path.to_path_buf(), handle);
        self.paths.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: i32) -> Result<(), WatchError> {
        let Some(path) = self.paths.get(&handle).cloned() else {
            return Ok(());
        };
        self.forget(&path);
        self.watcher
            .unwatch(&path)
            .map_err(|source| WatchError::RemoveWatch { path, source })
    }

    /// Notifications that translate to nothing (reads, attribute changes)
    /// do not end the wait.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<WatchEvent>, WatchError> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(received) => self.translate(received, &mut events),
                Err(RecvTimeoutError::Timeout) => return Ok(events),
                Err(RecvTimeoutError::Disconnected) => return Err(WatchError::Disconnected),
            }
            while let Ok(received) = self.events.try_recv() {
                self.translate(received, &mut events);
            }
            if !events.is_empty() {
                debug!(events = events.len(), "notifications drained");
                return Ok(events);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn test_classify_keeps_content_changes_only() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(Change::Modified)
        );
        assert_eq!(classify(&EventKind::Create(CreateKind::File)), Some(Change::Modified));
        assert_eq!(classify(&EventKind::Remove(RemoveKind::File)), Some(Change::Removed));
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(Change::Removed)
        );

        // The indexer opening and reading a file must not retrigger it
        assert_eq!(classify(&EventKind::Access(AccessKind::Read)), None);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))),
            None
        );
    }

    #[test]
    fn test_handles_follow_watches() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.cpp");
        let b = dir.path().join("b.cpp");
        std::fs::write(&a, "int a;\n").unwrap();
        std::fs::write(&b, "int b;\n").unwrap();

        let mut backend = NotifyBackend::new().unwrap();
        let ha = backend.add_watch(&a).unwrap();
        let hb = backend.add_watch(&b).unwrap();
        assert_ne!(ha, hb);

        backend.remove_watch(ha).unwrap();
        assert!(backend.paths.get(&ha).is_none());
        // Unknown handles are ignored
        backend.remove_watch(ha).unwrap();

        let missing = dir.path().join("missing.cpp");
        let err = backend.add_watch(&missing).unwrap_err();
        assert_eq!(err.code(), "WATCH_ADD_FAILED");
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut backend = NotifyBackend::new().unwrap();
        let mut out = Vec::new();
        let event = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        backend.translate(Ok(event), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].change, Change::Overflow);
    }
}
