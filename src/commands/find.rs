//! `find` — what the identifier at an offset refers to, and where it is defined.
//!
//! Output, one block per reference covering the offset (innermost first):
//!
//! ```text
//! -- helper -- identifier c:@F@helper
//!    /src/util.h:1:5: int helper() { return 1; }
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use super::{Context, SourceLines};
use crate::error::CommandError;
use crate::request::{Command, Flow, OptionSet, OptionSpec};
use crate::storage::{Location, SymbolRow};

pub struct FindCommand {
    ctx: Context,
    options: OptionSet,
}

impl FindCommand {
    pub fn new(ctx: Context) -> Self {
        let options = OptionSet::new()
            .with(OptionSpec::string("file", "").metavar("FILENAME").description("Source file name"))
            .with(OptionSpec::int("offset", 0).metavar("OFFSET").description("Offset in bytes"))
            .with(
                OptionSpec::bool("mostSpecific", false)
                    .description("Display only the most specific identifier at this location"),
            )
            .with(OptionSpec::bool("diagnostics", true).description("Print compilation diagnostics"))
            .with(
                OptionSpec::bool("fromIndex", true)
                    .description("Search in the index (faster but potentially out-of-date)"),
            );
        Self { ctx, options }
    }

    /// References covering `offset`, innermost first.
    fn references_at(&self, path: &Path, offset: usize, from_index: bool) -> Result<Vec<Location>, CommandError> {
        if from_index {
            return Ok(self.ctx.storage.references_at(path, offset)?);
        }

        let parsed = self.ctx.parse(path)?;
        let mut covering: Vec<&SymbolRow> = parsed
            .references
            .iter()
            .filter(|r| r.span.contains(offset))
            .collect();
        covering.sort_by_key(|r| (r.span.len(), r.span.offset1));
        Ok(covering
            .into_iter()
            .map(|r| located(path, r))
            .collect())
    }

    /// Definitions of `usr`: the index first, then the file's own fresh parse.
    fn definitions(&self, path: &Path, usr: &str, from_index: bool) -> Result<Vec<Location>, CommandError> {
        let stored = self.ctx.storage.definitions_of(usr)?;
        if !stored.is_empty() || from_index {
            return Ok(stored);
        }
        let parsed = self.ctx.parse(path)?;
        Ok(parsed
            .extraction
            .definitions
            .iter()
            .filter(|d| d.usr == usr)
            .map(|d| located(path, d))
            .collect())
    }
}

fn located(path: &Path, row: &SymbolRow) -> Location {
    Location {
        file: path.to_path_buf(),
        usr: row.usr.clone(),
        spelling: row.spelling.clone(),
        kind: row.kind.clone(),
        span: row.span,
    }
}

impl Command for FindCommand {
    fn name(&self) -> &str {
        "find"
    }

    fn description(&self) -> &str {
        "Find the definition of a symbol"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let path: PathBuf = self.ctx.resolve_file(self.options.str("file")?)?;
        let offset = self.options.int("offset")?;
        let offset = usize::try_from(offset)
            .map_err(|_| CommandError::InvalidArgument(format!("negative offset {offset}")))?;
        let most_specific = self.options.bool("mostSpecific")?;
        let from_index = self.options.bool("fromIndex")?;

        if self.options.bool("diagnostics")? {
            let parsed = self.ctx.parse(&path)?;
            for diag in &parsed.extraction.diagnostics {
                writeln!(
                    out,
                    "{}:{}:{}: error: {}",
                    path.display(),
                    diag.line,
                    diag.col,
                    diag.message
                )?;
            }
        }

        let mut references = self.references_at(&path, offset, from_index)?;
        if most_specific {
            references.truncate(1);
        }

        let mut lines = SourceLines::default();
        for reference in &references {
            writeln!(out, "-- {} -- {} {}", reference.spelling, reference.kind, reference.usr)?;
            let definitions = self.definitions(&path, &reference.usr, from_index)?;
            if definitions.is_empty() {
                writeln!(out, "   (no definition found)")?;
            }
            for def in &definitions {
                writeln!(
                    out,
                    "   {}:{}:{}: {}",
                    def.file.display(),
                    def.span.line,
                    def.span.col,
                    lines.line(&def.file, def.span.line)
                )?;
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::Project;
    use serde_json::{json, Value};

    const SOURCE: &str = "int helper() { return 1; }\nint main() { return helper(); }\n";

    fn find(project: &Project, values: &[(&str, Value)]) -> Result<String, CommandError> {
        let mut cmd = FindCommand::new(project.ctx.clone());
        cmd.reset_defaults();
        for (name, value) in values {
            cmd.options_mut().assign("find", name, value).unwrap();
        }
        project.run(&mut cmd)
    }

    #[test]
    fn test_find_from_index() {
        let project = Project::new(&[("a.cpp", SOURCE)]);
        project.index();

        let call = SOURCE.rfind("helper").unwrap() + 2;
        let text = find(&project, &[("file", json!("a.cpp")), ("offset", json!(call))]).unwrap();
        let expected = format!(
            "-- helper -- identifier c:@F@helper\n   {}:1:5: int helper() {{ return 1; }}\n",
            project.root.join("a.cpp").display()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_find_fresh_parse_sees_unindexed_file() {
        let project = Project::new(&[("a.cpp", SOURCE)]);
        let call = SOURCE.rfind("helper").unwrap();

        // Nothing indexed yet
        let text = find(&project, &[("file", json!("a.cpp")), ("offset", json!(call))]).unwrap();
        assert!(text.is_empty());

        let text = find(
            &project,
            &[("file", json!("a.cpp")), ("offset", json!(call)), ("fromIndex", json!(false))],
        )
        .unwrap();
        assert!(text.starts_with("-- helper -- identifier c:@F@helper\n"));
        assert!(text.contains(":1:5: int helper()"));
    }

    #[test]
    fn test_find_reports_diagnostics() {
        let project = Project::new(&[("bad.cpp", "int f( {\n")]);
        let text = find(&project, &[("file", json!("bad.cpp"))]).unwrap();
        assert!(text.contains(": error: "));

        let text = find(&project, &[("file", json!("bad.cpp")), ("diagnostics", json!(false))]).unwrap();
        assert!(!text.contains(": error: "));
    }

    #[test]
    fn test_find_argument_errors() {
        let project = Project::new(&[("a.cpp", SOURCE)]);
        assert_eq!(find(&project, &[]).unwrap_err().code(), "INVALID_ARGUMENT");
        assert_eq!(
            find(&project, &[("file", json!("nope.cpp"))]).unwrap_err().code(),
            "FILE_NOT_FOUND"
        );
        assert_eq!(
            find(&project, &[("file", json!("a.cpp")), ("offset", json!(-1))])
                .unwrap_err()
                .code(),
            "INVALID_ARGUMENT"
        );
    }
}
