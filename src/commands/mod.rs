//! The daemon's commands.
//!
//! | command    | options                                               |
//! |------------|-------------------------------------------------------|
//! | `load`     | `database`                                            |
//! | `config`   | `get`, `option`, `value`                              |
//! | `index`    | —                                                     |
//! | `find`     | `file`, `offset`, `mostSpecific`, `diagnostics`, `fromIndex` |
//! | `grep`     | `usr`, `format`                                       |
//! | `complete` | `file`, `line`, `column`                              |
//! | `exit`     | —                                                     |
//!
//! Every command shares one [`Context`]: the store, the update engine and
//! the parse cache.

mod complete;
mod config;
mod find;
mod grep;
mod load;

pub use complete::CompleteCommand;
pub use config::ConfigCommand;
pub use find::FindCommand;
pub use grep::GrepCommand;
pub use load::LoadCommand;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::error::{CommandError, RequestError};
use crate::indexer::{self, Extraction, NameTable};
use crate::request::{Command, Dispatcher, Flow, OptionSet};
use crate::storage::{Storage, SymbolRow};
use crate::update::{RebuildTrigger, UpdateEngine};

/// A freshly parsed file with its references resolved against the index.
#[derive(Debug)]
pub struct ParsedFile {
    pub source: String,
    pub extraction: Extraction,
    pub references: Vec<SymbolRow>,
}

pub type ParseCache = ResultCache<Arc<ParsedFile>>;

/// State shared by all commands.
#[derive(Clone)]
pub struct Context {
    /// Relative paths in requests resolve against this directory.
    pub root: PathBuf,
    pub storage: Arc<Storage>,
    pub engine: Arc<UpdateEngine>,
    pub cache: Arc<ParseCache>,
}

impl Context {
    /// Absolute, canonical path of an existing file named in a request.
    pub fn resolve_file(&self, name: &str) -> Result<PathBuf, CommandError> {
        if name.is_empty() {
            return Err(CommandError::InvalidArgument("a file name is required".to_string()));
        }
        let path = self.root.join(name);
        path.canonicalize()
            .map_err(|_| CommandError::FileNotFound(path))
    }

    /// Parse `path`, reusing the result until the next rebuild.
    pub fn parse(&self, path: &Path) -> Result<Arc<ParsedFile>, CommandError> {
        let key = path.to_string_lossy();
        self.cache.get_or_try_insert_with(&key, || {
            let bytes = fs::read(path)?;
            let extraction = indexer::extract_source(path, &bytes)?;
            let source = String::from_utf8_lossy(&bytes).into_owned();

            let replaced: HashSet<PathBuf> = [path.to_path_buf()].into_iter().collect();
            let mut names = NameTable::load(&self.storage, &replaced)?;
            names.add(path, &extraction.definitions);
            let references = indexer::resolve_references(&extraction, path, &names);

            Ok(Arc::new(ParsedFile {
                source,
                extraction,
                references,
            }))
        })
    }
}

/// Text of 1-based `line` in `source`, without its newline.
pub(crate) fn line_text(source: &str, line: usize) -> &str {
    source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .trim_end_matches('\r')
}

/// Reads source files once per command run.
#[derive(Default)]
pub(crate) struct SourceLines {
    files: std::collections::HashMap<PathBuf, String>,
}

impl SourceLines {
    pub(crate) fn line(&mut self, path: &Path, line: usize) -> String {
        let source = self
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| fs::read_to_string(path).unwrap_or_default());
        line_text(source, line).to_string()
    }
}

/// Trigger a rebuild and block until it has completed.
pub struct IndexCommand {
    ctx: Context,
    options: OptionSet,
}

impl IndexCommand {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            options: OptionSet::new(),
        }
    }
}

impl Command for IndexCommand {
    fn name(&self) -> &str {
        "index"
    }

    fn description(&self) -> &str {
        "Update the source code index"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        self.ctx.engine.request_rebuild();
        writeln!(out, "Waiting for the index to be rebuilt...")?;
        out.flush()?;
        self.ctx.engine.wait_for_rebuild()?;
        writeln!(out, "Done.")?;
        Ok(Flow::Continue)
    }
}

/// Shut the daemon down.
#[derive(Default)]
pub struct ExitCommand {
    options: OptionSet,
}

impl Command for ExitCommand {
    fn name(&self) -> &str {
        "exit"
    }

    fn description(&self) -> &str {
        "Shutdown server"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        writeln!(out, "Exiting...")?;
        Ok(Flow::Exit)
    }
}

/// A dispatcher with every command registered.
pub fn dispatcher(ctx: &Context) -> Result<Dispatcher, RequestError> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Box::new(LoadCommand::new(ctx.clone())))?;
    dispatcher.register(Box::new(ConfigCommand::new(ctx.clone())))?;
    dispatcher.register(Box::new(IndexCommand::new(ctx.clone())))?;
    dispatcher.register(Box::new(FindCommand::new(ctx.clone())))?;
    dispatcher.register(Box::new(GrepCommand::new(ctx.clone())))?;
    dispatcher.register(Box::new(CompleteCommand::new(ctx.clone())))?;
    dispatcher.register(Box::<ExitCommand>::default())?;
    Ok(dispatcher)
}
