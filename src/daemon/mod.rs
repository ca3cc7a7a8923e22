//! Daemon — keeps the index fresh in the background and serves commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                sourcetags serve              │
//! │                                              │
//! │  ┌────────────┐  request_rebuild  ┌────────┐ │
//! │  │  Watcher   │ ────────────────▶ │ Update │ │
//! │  │  (notify)  │ ◀──────────────── │ Engine │ │
//! │  └────────────┘  request_rescan   └────────┘ │
//! │        ▲            (weak)            │      │
//! │        │ list_watched_files           │      │
//! │  ┌────────────┐                  invalidate  │
//! │  │  Storage   │ ◀──┐                  ▼      │
//! │  └────────────┘    │            ┌──────────┐ │
//! │                    └─────────── │ commands │ │
//! │                                 └──────────┘ │
//! │  server loop: one connection, one request    │
//! └──────────────────────────────────────────────┘
//!           ▲
//!           │ .ct.sock
//!           ▼
//!      sourcetags send / editor client
//! ```

pub mod server;

pub use server::{is_daemon_running, running_pid, send_request, DiscoveryFiles};

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::cache::{Invalidate, ResultCache};
use crate::cancel::CancelToken;
use crate::commands::{self, Context, ParseCache};
use crate::config::DaemonConfig;
use crate::error::{Result, TagsError};
use crate::indexer::SourceIndexer;
use crate::request::{Dispatcher, Mode, Outcome};
use crate::storage::{Storage, WatchSource};
use crate::update::{RebuildTrigger, UpdateEngine};
use crate::watcher::{RescanRequest, Watcher};

/// Everything the daemon owns for its lifetime.
pub struct Daemon {
    root: PathBuf,
    config: DaemonConfig,
    storage: Arc<Storage>,
    cache: Arc<ParseCache>,
    engine: Arc<UpdateEngine>,
    watcher: Option<Arc<Watcher>>,
}

impl Daemon {
    /// Open the store named by `config` under `root` and wire the components.
    pub fn open(root: &Path, config: DaemonConfig) -> Result<Self> {
        let root = root.canonicalize()?;
        let config = config.resolve(&root);
        let storage = Arc::new(Storage::open(&config.database)?);
        info!(database = %config.database.display(), "index store opened");
        Self::with_storage(root, config, storage)
    }

    /// Wire the components around an existing store. `config` paths are used as given.
    pub fn with_storage(root: PathBuf, config: DaemonConfig, storage: Arc<Storage>) -> Result<Self> {
        let indexer = Arc::new(SourceIndexer::new(Arc::clone(&storage)));
        let cache: Arc<ParseCache> = Arc::new(ResultCache::new());
        let engine = Arc::new(UpdateEngine::new(
            indexer,
            Arc::clone(&cache) as Arc<dyn Invalidate>,
            config.poll_interval(),
        ));

        let watcher = if config.watch {
            Some(Self::watcher(&config, &engine, &storage)?)
        } else {
            info!("file watching disabled");
            None
        };

        if let Some(watcher) = &watcher {
            let rescan: Arc<dyn RescanRequest> = Arc::clone(watcher) as Arc<dyn RescanRequest>;
            engine.attach_watcher(Arc::downgrade(&rescan));
        }

        Ok(Self {
            root,
            config,
            storage,
            cache,
            engine,
            watcher,
        })
    }

    /// A watcher that cannot start is fatal; set `watch = false` to run without one.
    fn watcher(
        config: &DaemonConfig,
        engine: &Arc<UpdateEngine>,
        storage: &Arc<Storage>,
    ) -> Result<Arc<Watcher>> {
        let watcher = Watcher::with_notify(
            Arc::clone(engine) as Arc<dyn RebuildTrigger>,
            Arc::clone(storage) as Arc<dyn WatchSource>,
            config.poll_interval(),
            config.prune_watches,
        )
        .map_err(|e| {
            error!(code = e.code(), error = %e, "cannot start file watcher");
            e
        })?;
        Ok(Arc::new(watcher))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<UpdateEngine> {
        &self.engine
    }

    pub fn context(&self) -> Context {
        Context {
            root: self.root.clone(),
            storage: Arc::clone(&self.storage),
            engine: Arc::clone(&self.engine),
            cache: Arc::clone(&self.cache),
        }
    }

    pub fn dispatcher(&self) -> Result<Dispatcher> {
        Ok(commands::dispatcher(&self.context())?)
    }

    /// Start the update engine and watcher threads.
    ///
    /// Once the returned workers are dropped the engine stays stopped, so this
    /// is called once per `Daemon`.
    pub fn start_workers(&self) -> Result<Workers> {
        let mut workers = Workers::new();

        let engine = Arc::clone(&self.engine);
        let cancel = workers.cancel.clone();
        workers.spawn("update-engine", move || engine.run(&cancel))?;

        if let Some(watcher) = &self.watcher {
            let watcher = Arc::clone(watcher);
            let cancel = workers.cancel.clone();
            workers.spawn("file-watcher", move || watcher.run(&cancel))?;
        }
        Ok(workers)
    }

    /// Serve requests on the socket until `exit`.
    pub fn serve(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher()?;
        let workers = self.start_workers()?;
        let served = server::serve(&self.config, &mut dispatcher);
        workers.shutdown();
        served
    }

    /// Execute a single request read from `input`.
    pub fn serve_one<R, W>(&self, input: &mut R, out: &mut W) -> Result<Outcome>
    where
        R: BufRead + ?Sized,
        W: Write + ?Sized,
    {
        let mut dispatcher = self.dispatcher()?;
        let workers = self.start_workers()?;
        let outcome = dispatcher.dispatch_one(input, out, Mode::Lines);
        workers.shutdown();
        Ok(outcome?)
    }

    /// Prompt-driven session on stdin/stdout.
    pub fn shell(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher()?;
        let workers = self.start_workers()?;
        let stdin = io::stdin();
        let stdout = io::stdout();
        let outcome = dispatcher.run_interactive(&mut stdin.lock(), &mut stdout.lock());
        workers.shutdown();
        outcome?;
        Ok(())
    }
}

/// Background threads sharing one cancellation token.
///
/// Dropping cancels and joins them; each notices within one poll interval.
pub struct Workers {
    cancel: CancelToken,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            threads: Vec::new(),
        }
    }

    fn spawn(&mut self, name: &'static str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| TagsError::Internal(format!("cannot spawn {name} thread: {e}")))?;
        self.threads.push((name, handle));
        Ok(())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn shutdown(self) {}
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(thread = name, "background thread panicked");
            } else {
                info!(thread = name, "background thread joined");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn daemon(dir: &TempDir) -> Daemon {
        let root = dir.path().canonicalize().unwrap();
        let config = DaemonConfig {
            poll_interval_ms: 20,
            watch: false,
            ..DaemonConfig::default()
        }
        .resolve(&root);
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.set_option("index.exclude", &json!([])).unwrap();
        Daemon::with_storage(root, config, storage).unwrap()
    }

    #[test]
    fn test_load_then_index() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        fs::write(d.root().join("a.cpp"), "int main() { return 0; }\n").unwrap();
        fs::write(
            d.root().join("compile_commands.json"),
            json!([{"directory": d.root(), "file": "a.cpp", "command": "c++ -c a.cpp"}]).to_string(),
        )
        .unwrap();

        let mut dispatcher = d.dispatcher().unwrap();
        let workers = d.start_workers().unwrap();
        let mut input = Cursor::new(b"{\"command\":\"load\"}\n{\"command\":\"index\"}\n".to_vec());

        let mut out = Vec::new();
        let outcome = dispatcher.dispatch_one(&mut input, &mut out, Mode::Lines).unwrap();
        assert_eq!(outcome, Outcome::Served);
        assert!(String::from_utf8(out).unwrap().starts_with("Loaded 1 compile commands"));

        let mut out = Vec::new();
        dispatcher.dispatch_one(&mut input, &mut out, Mode::Lines).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Waiting for the index to be rebuilt...\nDone.\n"
        );
        workers.shutdown();
        assert!(d.engine().generation() >= 1);
    }

    #[test]
    fn test_serve_one_exit() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        let mut out = Vec::new();
        let outcome = d
            .serve_one(&mut Cursor::new(br#"{"command":"exit"}"#.to_vec()), &mut out)
            .unwrap();
        assert_eq!(outcome, Outcome::Exit);
        assert_eq!(out, b"Exiting...\n");
    }

    #[test]
    fn test_workers_stop_on_drop() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        let workers = d.start_workers().unwrap();
        let token = workers.cancel_token();
        workers.shutdown();
        assert!(token.is_cancelled());
        // Engine observed the cancellation and refuses new waiters
        assert!(d.engine().wait_for_rebuild().is_err());
    }
}
