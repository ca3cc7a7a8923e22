//! Row types exchanged between the indexer, the query commands and storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One compilation database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCommand {
    pub file: PathBuf,
    pub directory: PathBuf,
    pub arguments: Vec<String>,
}

impl CompileCommand {
    /// Include directories from `-I dir` / `-Idir` flags, resolved against `directory`.
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let mut args = self.arguments.iter();
        while let Some(arg) = args.next() {
            let dir = match arg.strip_prefix("-I") {
                Some("") => args.next().map(String::as_str),
                Some(rest) => Some(rest),
                None => None,
            };
            if let Some(dir) = dir {
                dirs.push(self.directory.join(dir));
            }
        }
        dirs
    }
}

/// A file tracked by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub path: PathBuf,
    /// Modification time (ns since epoch) at last indexing, 0 if never indexed.
    pub mtime: i64,
    pub indexed_at: Option<String>,
}

/// Byte range plus 1-based line / column of its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub offset1: usize,
    pub offset2: usize,
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn contains(&self, offset: usize) -> bool {
        self.offset1 <= offset && offset < self.offset2
    }

    pub fn len(&self) -> usize {
        self.offset2.saturating_sub(self.offset1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A symbol occurrence (definition or reference) with its resolved USR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRow {
    pub usr: String,
    pub spelling: String,
    pub kind: String,
    pub span: Span,
}

/// A symbol occurrence located in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub usr: String,
    pub spelling: String,
    pub kind: String,
    #[serde(flatten)]
    pub span: Span,
}

/// Everything storage needs to replace the indexed content of one file.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    pub definitions: Vec<SymbolRow>,
    pub references: Vec<SymbolRow>,
    pub includes: Vec<PathBuf>,
}

/// Completion candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub spelling: String,
    pub kind: String,
    pub usr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_dirs_both_forms() {
        let cmd = CompileCommand {
            file: PathBuf::from("/p/a.cpp"),
            directory: PathBuf::from("/p"),
            arguments: vec![
                "c++".into(),
                "-Iinclude".into(),
                "-I".into(),
                "/abs/inc".into(),
                "-DFOO".into(),
                "-c".into(),
                "a.cpp".into(),
            ],
        };
        assert_eq!(
            cmd.include_dirs(),
            vec![PathBuf::from("/p/include"), PathBuf::from("/abs/inc")]
        );
    }

    #[test]
    fn test_span_contains_is_half_open() {
        let span = Span {
            offset1: 4,
            offset2: 8,
            line: 1,
            col: 5,
        };
        assert!(span.contains(4));
        assert!(span.contains(7));
        assert!(!span.contains(8));
        assert_eq!(span.len(), 4);
    }
}
