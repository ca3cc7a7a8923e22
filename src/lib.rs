//! # sourcetags
//!
//! A source code indexing daemon for C and C++ projects.
//!
//! The daemon reads a compilation database, indexes definitions and
//! references with tree-sitter into SQLite, keeps the index fresh as files
//! change, and answers `find`, `grep` and `complete` queries over a Unix
//! socket.
//!
//! ## Key Features
//!
//! - **Single-flight rebuilds**: at most one rebuild runs at a time; every
//!   request made during a rebuild is satisfied by the next one
//! - **Real-time**: a file watcher requests a rebuild whenever an indexed
//!   file changes
//! - **Typed commands**: JSON requests are bound to declared, typed options
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sourcetags::{Daemon, DaemonConfig};
//! use std::path::Path;
//!
//! let root = Path::new(".");
//! let config = DaemonConfig::load(root)?;
//! let daemon = Daemon::open(root, config)?;
//! // Blocks until a client sends {"command": "exit"}
//! daemon.serve()?;
//! # Ok::<(), sourcetags::TagsError>(())
//! ```

pub mod cache;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod indexer;
pub mod request;
pub mod storage;
pub mod update;
pub mod watcher;

// Re-exports for convenience
pub use cache::{Invalidate, ResultCache};
pub use cancel::CancelToken;
pub use config::DaemonConfig;
pub use daemon::{is_daemon_running, send_request, Daemon};
pub use error::{CommandError, RequestError, Result, TagsError};
pub use indexer::{Indexer, RebuildStats, SourceIndexer};
pub use request::{Command, Dispatcher, Flow, Mode, OptionSet, OptionSpec, OptionValue, Outcome, Request, Response};
pub use storage::Storage;
pub use update::{RebuildState, RebuildTrigger, UpdateEngine};
pub use watcher::{Change, NotifyBackend, RescanRequest, WatchBackend, WatchEvent, Watcher};
