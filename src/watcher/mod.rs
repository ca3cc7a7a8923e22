//! File watcher — turns modification notifications into rebuild requests.
//!
//! ```text
//!   loop (until cancelled)
//!     ├─ rescan requested?  list files from storage, register missing watches
//!     ├─ poll backend (bounded timeout)
//!     └─ any events?        log them, request_rebuild() once
//! ```
//!
//! A burst of edits that lands within one poll coalesces into a single
//! rebuild request.

pub mod backend;

pub use backend::NotifyBackend;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::WatchError;
use crate::storage::WatchSource;
use crate::update::RebuildTrigger;

/// Out-of-band request to recompute the watch list.
pub trait RescanRequest: Send + Sync {
    fn request_rescan(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Modified,
    /// Deleted or renamed away; the watch went with it.
    Removed,
    /// The OS queue overflowed and events were lost.
    Overflow,
}

/// One notification. `handle` is `None` for paths this backend never
/// registered, and for overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub handle: Option<i32>,
    pub path: Option<PathBuf>,
    pub change: Change,
}

/// OS notification facility.
pub trait WatchBackend: Send {
    fn add_watch(&mut self, path: &Path) -> Result<i32, WatchError>;
    fn remove_watch(&mut self, handle: i32) -> Result<(), WatchError>;
    /// Waits up to `timeout` and returns every pending event.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<WatchEvent>, WatchError>;
}

/// File ↔ watch handle bindings.
///
/// Two paths may share a handle when they name the same inode.
#[derive(Debug, Default)]
pub struct WatchTable {
    by_path: HashMap<PathBuf, i32>,
    by_handle: HashMap<i32, PathBuf>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: PathBuf, handle: i32) {
        self.by_handle.entry(handle).or_insert_with(|| path.clone());
        self.by_path.insert(path, handle);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn handle(&self, path: &Path) -> Option<i32> {
        self.by_path.get(path).copied()
    }

    pub fn file_name(&self, handle: i32) -> Option<&Path> {
        self.by_handle.get(&handle).map(PathBuf::as_path)
    }

    /// Forget every path bound to `handle`.
    pub fn remove_handle(&mut self, handle: i32) -> Vec<PathBuf> {
        self.by_handle.remove(&handle);
        let gone: Vec<PathBuf> = self
            .by_path
            .iter()
            .filter(|(_, h)| **h == handle)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &gone {
            self.by_path.remove(path);
        }
        gone
    }

    /// Keep only `wanted` paths. Returns the dropped paths paired with the
    /// handles no remaining path uses.
    pub fn retain_only(&mut self, wanted: &HashSet<PathBuf>) -> Vec<(PathBuf, Option<i32>)> {
        let dropped: Vec<(PathBuf, i32)> = self
            .by_path
            .iter()
            .filter(|(p, _)| !wanted.contains(*p))
            .map(|(p, h)| (p.clone(), *h))
            .collect();
        for (path, _) in &dropped {
            self.by_path.remove(path);
        }

        let live: HashSet<i32> = self.by_path.values().copied().collect();
        self.by_handle.retain(|_, p| self.by_path.contains_key(p));
        // Rebind handles whose recorded name was one of the dropped aliases
        for (path, handle) in &self.by_path {
            self.by_handle.entry(*handle).or_insert_with(|| path.clone());
        }

        dropped
            .into_iter()
            .map(|(p, h)| {
                let orphaned = (!live.contains(&h)).then_some(h);
                (p, orphaned)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.by_path.keys().cloned().collect();
        paths.sort();
        paths
    }
}

pub struct Watcher {
    rescan_requested: AtomicBool,
    table: Mutex<WatchTable>,
    backend: Mutex<Box<dyn WatchBackend>>,
    trigger: Arc<dyn RebuildTrigger>,
    source: Arc<dyn WatchSource>,
    poll_interval: Duration,
    prune: bool,
}

impl Watcher {
    /// The first loop iteration always scans.
    pub fn new(
        backend: Box<dyn WatchBackend>,
        trigger: Arc<dyn RebuildTrigger>,
        source: Arc<dyn WatchSource>,
        poll_interval: Duration,
        prune: bool,
    ) -> Self {
        Self {
            rescan_requested: AtomicBool::new(true),
            table: Mutex::new(WatchTable::new()),
            backend: Mutex::new(backend),
            trigger,
            source,
            poll_interval,
            prune,
        }
    }

    /// Watcher over the platform's notification facility. Fails when it is unavailable.
    pub fn with_notify(
        trigger: Arc<dyn RebuildTrigger>,
        source: Arc<dyn WatchSource>,
        poll_interval: Duration,
        prune: bool,
    ) -> Result<Self, WatchError> {
        let backend = NotifyBackend::new()?;
        Ok(Self::new(Box::new(backend), trigger, source, poll_interval, prune))
    }

    /// Currently watched files, sorted.
    pub fn watched(&self) -> Vec<PathBuf> {
        self.table.lock().paths()
    }

    pub fn run(&self, cancel: &CancelToken) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            prune = self.prune,
            "file watcher started"
        );

        while !cancel.is_cancelled() {
            if let Err(e) = self.step() {
                warn!(code = e.code(), error = %e, "file watcher error");
                thread::sleep(self.poll_interval);
            }
        }

        info!("file watcher stopped");
    }

    /// One loop iteration. Returns the number of events seen.
    pub fn step(&self) -> Result<usize, WatchError> {
        if self.rescan_requested.swap(false, Ordering::SeqCst) {
            self.rescan();
        }

        let events = self.backend.lock().poll(self.poll_interval)?;
        if events.is_empty() {
            return Ok(0);
        }

        {
            let mut table = self.table.lock();
            for event in &events {
                let name = event
                    .handle
                    .and_then(|h| table.file_name(h))
                    .or(event.path.as_deref())
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                match (event.change, event.handle) {
                    (Change::Modified, _) => debug!(path = %name, "file changed"),
                    (Change::Removed, Some(handle)) => {
                        // Re-registered by the rescan that follows the rebuild
                        for path in table.remove_handle(handle) {
                            debug!(path = %path.display(), "file removed, watch dropped");
                        }
                    }
                    (Change::Removed, None) => debug!(path = %name, "unwatched file removed"),
                    (Change::Overflow, _) => {
                        warn!("notification queue overflowed, rescanning watch list");
                        self.rescan_requested.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        self.trigger.request_rebuild();
        Ok(events.len())
    }

    fn rescan(&self) {
        let files = match self.source.list_watched_files() {
            Ok(files) => files,
            Err(e) => {
                warn!(code = e.code(), error = %e, "cannot list files to watch");
                return;
            }
        };

        let mut backend = self.backend.lock();
        let mut table = self.table.lock();

        let mut pruned = 0usize;
        if self.prune {
            let wanted: HashSet<PathBuf> = files.iter().cloned().collect();
            for (path, handle) in table.retain_only(&wanted) {
                if let Some(handle) = handle {
                    if let Err(e) = backend.remove_watch(handle) {
                        debug!(path = %path.display(), error = %e, "remove watch failed");
                    }
                }
                pruned += 1;
            }
        }

        let mut added = 0usize;
        let mut failed = 0usize;
        for path in files {
            if table.contains(&path) {
                continue;
            }
            match backend.add_watch(&path) {
                Ok(handle) => {
                    table.insert(path, handle);
                    added += 1;
                }
                Err(e) => {
                    warn!(code = e.code(), error = %e, "cannot watch file");
                    failed += 1;
                }
            }
        }

        info!(watched = table.len(), added, pruned, failed, "watch list rescanned");
    }
}

impl RescanRequest for Watcher {
    fn request_rescan(&self) {
        self.rescan_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageResult;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(10);

    #[derive(Default)]
    struct FakeState {
        next: i32,
        added: Vec<PathBuf>,
        removed: Vec<i32>,
        refuse: HashSet<PathBuf>,
        pending: VecDeque<Vec<WatchEvent>>,
    }

    struct FakeBackend(Arc<parking_lot::Mutex<FakeState>>);

    impl WatchBackend for FakeBackend {
        fn add_watch(&mut self, path: &Path) -> Result<i32, WatchError> {
            let mut state = self.0.lock();
            if state.refuse.contains(path) {
                return Err(WatchError::AddWatch {
                    path: path.to_path_buf(),
                    source: notify::Error::path_not_found(),
                });
            }
            state.next += 1;
            state.added.push(path.to_path_buf());
            Ok(state.next)
        }

        fn remove_watch(&mut self, handle: i32) -> Result<(), WatchError> {
            self.0.lock().removed.push(handle);
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<Vec<WatchEvent>, WatchError> {
            Ok(self.0.lock().pending.pop_front().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct CountingTrigger(AtomicUsize);

    impl RebuildTrigger for CountingTrigger {
        fn request_rebuild(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ListSource(parking_lot::Mutex<Vec<PathBuf>>);

    impl WatchSource for ListSource {
        fn list_watched_files(&self) -> StorageResult<Vec<PathBuf>> {
            Ok(self.0.lock().clone())
        }
    }

    struct Fixture {
        state: Arc<parking_lot::Mutex<FakeState>>,
        trigger: Arc<CountingTrigger>,
        source: Arc<ListSource>,
        watcher: Watcher,
    }

    fn fixture(files: &[&str], prune: bool) -> Fixture {
        let state = Arc::new(parking_lot::Mutex::new(FakeState::default()));
        let trigger = Arc::new(CountingTrigger::default());
        let source = Arc::new(ListSource(parking_lot::Mutex::new(
            files.iter().map(PathBuf::from).collect(),
        )));
        let watcher = Watcher::new(
            Box::new(FakeBackend(Arc::clone(&state))),
            trigger.clone(),
            source.clone(),
            POLL,
            prune,
        );
        Fixture {
            state,
            trigger,
            source,
            watcher,
        }
    }

    fn modify(handle: i32) -> WatchEvent {
        WatchEvent {
            handle: Some(handle),
            path: None,
            change: Change::Modified,
        }
    }

    #[test]
    fn test_one_rebuild_per_wakeup() {
        let f = fixture(&["/p/a.cpp", "/p/b.cpp"], true);
        assert_eq!(f.watcher.step().unwrap(), 0);
        assert_eq!(f.trigger.0.load(Ordering::SeqCst), 0);

        // Two files, three events, one wake-up
        f.state
            .lock()
            .pending
            .push_back(vec![modify(1), modify(1), modify(2)]);
        assert_eq!(f.watcher.step().unwrap(), 3);
        assert_eq!(f.trigger.0.load(Ordering::SeqCst), 1);

        f.state.lock().pending.push_back(vec![modify(2)]);
        f.watcher.step().unwrap();
        assert_eq!(f.trigger.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rescans_never_duplicate_watches() {
        let f = fixture(&["/p/a.cpp"], true);
        f.watcher.step().unwrap();
        f.watcher.request_rescan();
        f.watcher.step().unwrap();
        f.watcher.request_rescan();
        f.watcher.step().unwrap();

        assert_eq!(f.state.lock().added, vec![PathBuf::from("/p/a.cpp")]);
        assert_eq!(f.watcher.watched(), vec![PathBuf::from("/p/a.cpp")]);
    }

    #[test]
    fn test_rescan_only_when_requested() {
        let f = fixture(&["/p/a.cpp"], true);
        f.watcher.step().unwrap();
        f.source.0.lock().push(PathBuf::from("/p/b.cpp"));

        f.watcher.step().unwrap();
        assert_eq!(f.watcher.watched().len(), 1);

        f.watcher.request_rescan();
        f.watcher.step().unwrap();
        assert_eq!(f.watcher.watched().len(), 2);
    }

    #[test]
    fn test_failed_registration_retried_on_next_rescan() {
        let f = fixture(&["/p/a.cpp", "/p/gone.cpp"], true);
        f.state.lock().refuse.insert(PathBuf::from("/p/gone.cpp"));
        f.watcher.step().unwrap();
        assert_eq!(f.watcher.watched(), vec![PathBuf::from("/p/a.cpp")]);

        f.state.lock().refuse.clear();
        f.watcher.request_rescan();
        f.watcher.step().unwrap();
        assert_eq!(f.watcher.watched().len(), 2);
    }

    #[test]
    fn test_prune_removes_stale_watches() {
        let f = fixture(&["/p/a.cpp", "/p/b.cpp"], true);
        f.watcher.step().unwrap();

        *f.source.0.lock() = vec![PathBuf::from("/p/a.cpp")];
        f.watcher.request_rescan();
        f.watcher.step().unwrap();

        assert_eq!(f.watcher.watched(), vec![PathBuf::from("/p/a.cpp")]);
        assert_eq!(f.state.lock().removed, vec![2]);
    }

    #[test]
    fn test_without_prune_watches_accumulate() {
        let f = fixture(&["/p/a.cpp", "/p/b.cpp"], false);
        f.watcher.step().unwrap();

        *f.source.0.lock() = vec![PathBuf::from("/p/a.cpp")];
        f.watcher.request_rescan();
        f.watcher.step().unwrap();

        assert_eq!(f.watcher.watched().len(), 2);
        assert!(f.state.lock().removed.is_empty());
    }

    #[test]
    fn test_removed_file_drops_binding() {
        let f = fixture(&["/p/a.cpp"], true);
        f.watcher.step().unwrap();
        f.state.lock().pending.push_back(vec![WatchEvent {
            handle: Some(1),
            path: Some(PathBuf::from("/p/a.cpp")),
            change: Change::Removed,
        }]);
        f.watcher.step().unwrap();
        assert!(f.watcher.watched().is_empty());
        assert_eq!(f.trigger.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overflow_rebuilds_and_rescans() {
        let f = fixture(&["/p/a.cpp"], true);
        f.watcher.step().unwrap();
        f.source.0.lock().push(PathBuf::from("/p/b.cpp"));

        f.state.lock().pending.push_back(vec![WatchEvent {
            handle: None,
            path: None,
            change: Change::Overflow,
        }]);
        assert_eq!(f.watcher.step().unwrap(), 1);
        assert_eq!(f.trigger.0.load(Ordering::SeqCst), 1);

        // No explicit request_rescan, yet the next step picks up b.cpp
        f.watcher.step().unwrap();
        assert_eq!(f.watcher.watched().len(), 2);
    }

    #[test]
    fn test_watch_table_shared_handle() {
        let mut table = WatchTable::new();
        table.insert(PathBuf::from("/p/a.h"), 7);
        table.insert(PathBuf::from("/p/link.h"), 7);
        table.insert(PathBuf::from("/p/b.h"), 8);
        assert_eq!(table.file_name(7), Some(Path::new("/p/a.h")));

        let wanted: HashSet<PathBuf> = [PathBuf::from("/p/link.h")].into_iter().collect();
        let mut dropped = table.retain_only(&wanted);
        dropped.sort();
        // Handle 7 is still used by link.h, only 8 is orphaned
        assert_eq!(
            dropped,
            vec![(PathBuf::from("/p/a.h"), None), (PathBuf::from("/p/b.h"), Some(8))]
        );
        assert_eq!(table.file_name(7), Some(Path::new("/p/link.h")));
        assert_eq!(table.handle(Path::new("/p/link.h")), Some(7));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_modifications_coalesce() {
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.cpp");
        std::fs::write(&file, "int a;\n").unwrap();

        let trigger = Arc::new(CountingTrigger::default());
        let source = Arc::new(ListSource(parking_lot::Mutex::new(vec![file.clone()])));
        let watcher =
            Watcher::with_notify(trigger.clone(), source, Duration::from_millis(200), true).unwrap();
        watcher.step().unwrap();
        assert_eq!(watcher.watched(), vec![file.clone()]);

        for line in ["int b;\n", "int c;\n"] {
            let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            f.write_all(line.as_bytes()).unwrap();
        }

        // Identical unread events may be merged
        assert!(watcher.step().unwrap() >= 1);
        assert_eq!(trigger.0.load(Ordering::SeqCst), 1);
    }
}
