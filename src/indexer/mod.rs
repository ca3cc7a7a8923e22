//! Source indexer — keeps the stored symbol tables in sync with the files on disk.
//!
//! ```text
//! rebuild()
//!   ├─ drop files that no longer exist
//!   ├─ select files whose mtime changed (or were never indexed)
//!   ├─ parse them in parallel (rayon + tree-sitter), then any newly
//!   │  included headers, until no new file shows up
//!   ├─ resolve identifier occurrences to USRs by name
//!   └─ store each file in its own transaction
//! ```

pub mod extract;

pub use extract::{extract_source, Diagnostic, Extraction, Occurrence};

use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};
use crate::storage::{FileIndex, Storage, SymbolRow};

/// Bound on the include-discovery rounds of one rebuild.
const MAX_ROUNDS: usize = 16;

/// The engine's view of the indexer.
pub trait Indexer: Send + Sync {
    fn rebuild(&self) -> IndexResult<RebuildStats>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub files_checked: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub definitions: usize,
    pub references: usize,
}

/// Definition names known to the index: spelling → (usr, file).
pub struct NameTable {
    names: HashMap<String, Vec<(String, PathBuf)>>,
}

impl NameTable {
    /// Stored definitions, minus those of `replaced` files.
    pub fn load(storage: &Storage, replaced: &HashSet<PathBuf>) -> IndexResult<Self> {
        let mut names: HashMap<String, Vec<(String, PathBuf)>> = HashMap::new();
        for (spelling, usr, file) in storage.definition_names()? {
            if !replaced.contains(&file) {
                names.entry(spelling).or_default().push((usr, file));
            }
        }
        Ok(Self { names })
    }

    pub fn add(&mut self, file: &Path, definitions: &[SymbolRow]) {
        for def in definitions {
            self.names
                .entry(def.spelling.clone())
                .or_default()
                .push((def.usr.clone(), file.to_path_buf()));
        }
    }

    /// Definition a spelling refers to from `file`: same file first, then
    /// the lexicographically smallest USR.
    pub fn resolve(&self, spelling: &str, file: &Path) -> Option<&str> {
        let candidates = self.names.get(spelling)?;
        candidates
            .iter()
            .find(|(_, f)| f == file)
            .or_else(|| candidates.iter().min_by(|a, b| a.0.cmp(&b.0)))
            .map(|(usr, _)| usr.as_str())
    }
}

/// Turn an extraction into storable rows.
pub fn resolve_references(extraction: &Extraction, file: &Path, names: &NameTable) -> Vec<SymbolRow> {
    extraction
        .occurrences
        .iter()
        .filter_map(|occ| {
            let usr = match &occ.usr {
                Some(usr) => usr.clone(),
                None => names.resolve(&occ.spelling, file)?.to_string(),
            };
            Some(SymbolRow {
                usr,
                spelling: occ.spelling.clone(),
                kind: occ.kind.to_string(),
                span: occ.span,
            })
        })
        .collect()
}

/// Parse one file from disk.
pub fn parse_file(path: &Path) -> IndexResult<Extraction> {
    let source = fs::read(path).map_err(|source| IndexError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    extract_source(path, &source)
}

fn mtime_ns(path: &Path) -> std::io::Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0))
}

/// Indexer over the SQLite store.
pub struct SourceIndexer {
    storage: Arc<Storage>,
}

impl SourceIndexer {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn exclude_patterns(&self) -> IndexResult<Vec<Regex>> {
        self.storage
            .exclude_patterns()?
            .iter()
            .map(|p| Regex::new(p).map_err(|e| IndexError::InvalidPattern(format!("{p}: {e}"))))
            .collect()
    }

    /// Where to look for quoted includes of `file`.
    fn include_dirs(&self) -> IndexResult<HashMap<PathBuf, Vec<PathBuf>>> {
        let mut dirs = HashMap::new();
        for cmd in self.storage.compile_commands()? {
            dirs.insert(cmd.file.clone(), cmd.include_dirs());
        }
        Ok(dirs)
    }

    fn locate_include(name: &str, file: &Path, dirs: &[PathBuf]) -> Option<PathBuf> {
        let own_dir = file.parent().map(Path::to_path_buf);
        own_dir
            .iter()
            .chain(dirs.iter())
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .map(|found| found.canonicalize().unwrap_or(found))
    }

    /// Stat `path` against its stored mtime; queue it if it changed.
    fn check(
        &self,
        path: PathBuf,
        stored_mtime: i64,
        stale: &mut Vec<(PathBuf, i64)>,
        stats: &mut RebuildStats,
    ) -> IndexResult<()> {
        stats.files_checked += 1;
        match mtime_ns(&path) {
            Ok(mtime) if mtime != stored_mtime => stale.push((path, mtime)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "file vanished");
                self.storage.remove_file(&path)?;
                stats.files_removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat file");
                stats.files_failed += 1;
            }
        }
        Ok(())
    }
}

struct Parsed {
    path: PathBuf,
    mtime: i64,
    extraction: Extraction,
    includes: Vec<PathBuf>,
}

fn is_excluded(excludes: &[Regex], path: &Path) -> bool {
    let key = path.to_string_lossy();
    excludes.iter().any(|re| re.is_match(&key))
}

impl Indexer for SourceIndexer {
    fn rebuild(&self) -> IndexResult<RebuildStats> {
        let excludes = self.exclude_patterns()?;
        let include_dirs = self.include_dirs()?;

        // Headers have no compile command; search every translation unit's -I dirs
        let mut fallback_dirs: Vec<PathBuf> = Vec::new();
        for dirs in include_dirs.values() {
            for dir in dirs {
                if !fallback_dirs.contains(dir) {
                    fallback_dirs.push(dir.clone());
                }
            }
        }

        let mut stats = RebuildStats::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut stale = Vec::new();
        for record in self.storage.files()? {
            seen.insert(record.path.clone());
            if is_excluded(&excludes, &record.path) {
                debug!(path = %record.path.display(), "excluded from index");
                continue;
            }
            self.check(record.path, record.mtime, &mut stale, &mut stats)?;
        }

        // Parse changed files, then any newly included headers, until closed
        let mut parsed: Vec<Parsed> = Vec::new();
        for _ in 0..MAX_ROUNDS {
            if stale.is_empty() {
                break;
            }
            let batch: Vec<(PathBuf, i64, IndexResult<Extraction>)> = std::mem::take(&mut stale)
                .into_par_iter()
                .map(|(path, mtime)| {
                    let result = parse_file(&path);
                    (path, mtime, result)
                })
                .collect();

            for (path, mtime, result) in batch {
                let extraction = match result {
                    Ok(extraction) => extraction,
                    Err(e) => {
                        warn!(path = %path.display(), code = e.code(), error = %e, "cannot index file");
                        stats.files_failed += 1;
                        continue;
                    }
                };

                let dirs = include_dirs
                    .get(&path)
                    .map(Vec::as_slice)
                    .unwrap_or(&fallback_dirs);
                let includes: Vec<PathBuf> = extraction
                    .includes
                    .iter()
                    .filter_map(|name| Self::locate_include(name, &path, dirs))
                    .filter(|inc| !is_excluded(&excludes, inc))
                    .collect();

                for inc in &includes {
                    if seen.insert(inc.clone()) {
                        self.check(inc.clone(), 0, &mut stale, &mut stats)?;
                    }
                }

                parsed.push(Parsed {
                    path,
                    mtime,
                    extraction,
                    includes,
                });
            }
        }

        if parsed.is_empty() {
            return Ok(stats);
        }

        let replaced: HashSet<PathBuf> = parsed.iter().map(|p| p.path.clone()).collect();
        let mut names = NameTable::load(&self.storage, &replaced)?;
        for p in &parsed {
            names.add(&p.path, &p.extraction.definitions);
        }

        for p in parsed {
            let index = FileIndex {
                references: resolve_references(&p.extraction, &p.path, &names),
                definitions: p.extraction.definitions,
                includes: p.includes,
            };
            stats.definitions += index.definitions.len();
            stats.references += index.references.len();

            self.storage.store_file_index(&p.path, p.mtime, &index)?;
            debug!(
                path = %p.path.display(),
                definitions = index.definitions.len(),
                references = index.references.len(),
                "file indexed"
            );
            stats.files_indexed += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CompileCommand;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn setup(files: &[(&str, &str)]) -> (TempDir, PathBuf, Arc<Storage>, SourceIndexer) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        for (name, content) in files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.set_option("index.exclude", &json!([])).unwrap();
        let indexer = SourceIndexer::new(Arc::clone(&storage));
        (dir, root, storage, indexer)
    }

    fn register(storage: &Storage, dir: &Path, file: &str, extra: &[&str]) {
        let mut arguments = vec!["c++".to_string()];
        arguments.extend(extra.iter().map(|s| s.to_string()));
        arguments.push(file.to_string());
        storage
            .set_compile_command(&CompileCommand {
                file: dir.join(file),
                directory: dir.to_path_buf(),
                arguments,
            })
            .unwrap();
    }

    #[test]
    fn test_rebuild_indexes_and_follows_includes() {
        let (_dir, root, storage, indexer) = setup(&[
            ("main.cpp", "#include \"util.h\"\nint main() { return helper(); }\n"),
            ("inc/util.h", "int helper() { return 1; }\n"),
        ]);
        register(&storage, &root, "main.cpp", &["-Iinc"]);

        let stats = indexer.rebuild().unwrap();
        assert_eq!(stats.files_indexed, 2);

        let defs = storage.definitions_of("c:@F@helper").unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].file, root.join("inc/util.h"));

        // The call in main.cpp resolves to the header's definition
        let refs = storage.references_to("c:@F@helper").unwrap();
        assert!(refs.iter().any(|r| r.file == root.join("main.cpp")));
    }

    #[test]
    fn test_rebuild_skips_unchanged_files() {
        let (_dir, root, storage, indexer) = setup(&[("a.cpp", "int a() { return 0; }\n")]);
        register(&storage, &root, "a.cpp", &[]);

        assert_eq!(indexer.rebuild().unwrap().files_indexed, 1);
        let second = indexer.rebuild().unwrap();
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_checked, 1);
    }

    #[test]
    fn test_rebuild_removes_vanished_files() {
        let (_dir, root, storage, indexer) = setup(&[("a.cpp", "int a() { return 0; }\n")]);
        register(&storage, &root, "a.cpp", &[]);
        indexer.rebuild().unwrap();

        fs::remove_file(root.join("a.cpp")).unwrap();
        let stats = indexer.rebuild().unwrap();
        assert_eq!(stats.files_removed, 1);
        assert!(storage.definitions_of("c:@F@a").unwrap().is_empty());
    }

    #[test]
    fn test_exclude_patterns_apply() {
        let (_dir, root, storage, indexer) = setup(&[("skip.cpp", "int s() { return 0; }\n")]);
        register(&storage, &root, "skip.cpp", &[]);
        storage.set_option("index.exclude", &json!(["skip\\.cpp$"])).unwrap();

        assert_eq!(indexer.rebuild().unwrap().files_indexed, 0);

        storage.set_option("index.exclude", &json!(["("])).unwrap();
        let err = indexer.rebuild().unwrap_err();
        assert_eq!(err.code(), "INVALID_PATTERN");
    }

    #[test]
    fn test_name_table_prefers_same_file() {
        let storage = Storage::in_memory().unwrap();
        let mut names = NameTable::load(&storage, &HashSet::new()).unwrap();
        let row = |usr: &str| SymbolRow {
            usr: usr.to_string(),
            spelling: "f".to_string(),
            kind: "function".to_string(),
            span: crate::storage::Span { offset1: 0, offset2: 1, line: 1, col: 1 },
        };
        names.add(Path::new("/b.cpp"), &[row("c:@N@b@F@f")]);
        names.add(Path::new("/a.cpp"), &[row("c:@N@a@F@f")]);

        assert_eq!(names.resolve("f", Path::new("/b.cpp")), Some("c:@N@b@F@f"));
        assert_eq!(names.resolve("f", Path::new("/c.cpp")), Some("c:@N@a@F@f"));
        assert_eq!(names.resolve("g", Path::new("/c.cpp")), None);
    }
}
