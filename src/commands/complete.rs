//! `complete` — symbols whose name extends the identifier before point.

use std::collections::BTreeMap;
use std::io::Write;

use super::Context;
use crate::error::CommandError;
use crate::request::{Command, Flow, OptionSet, OptionSpec};
use crate::storage::Candidate;

/// Identifier characters immediately before 0-based (`line`, `column`).
fn prefix_at(source: &str, line: usize, column: usize) -> Result<&str, CommandError> {
    let text = source
        .split('\n')
        .nth(line)
        .ok_or_else(|| CommandError::InvalidArgument(format!("line {line} is past the end of the file")))?;
    let text = text.strip_suffix('\r').unwrap_or(text);
    let column = column.min(text.len());
    let before = text
        .get(..column)
        .ok_or_else(|| CommandError::InvalidArgument(format!("column {column} splits a character")))?;

    let start = before
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(before.len());
    Ok(&before[start..])
}

pub struct CompleteCommand {
    ctx: Context,
    options: OptionSet,
}

impl CompleteCommand {
    pub fn new(ctx: Context) -> Self {
        let options = OptionSet::new()
            .with(OptionSpec::string("file", "").metavar("FILENAME").description("Source file name"))
            .with(
                OptionSpec::int("line", 0)
                    .metavar("LINE_NO")
                    .description("Line number (counting from 0)"),
            )
            .with(
                OptionSpec::int("column", 0)
                    .metavar("COLUMN_NO")
                    .description("Column number (counting from 0)"),
            );
        Self { ctx, options }
    }

    fn position(&self, name: &str) -> Result<usize, CommandError> {
        let value = self.options.int(name)?;
        usize::try_from(value).map_err(|_| CommandError::InvalidArgument(format!("negative {name} {value}")))
    }
}

impl Command for CompleteCommand {
    fn name(&self) -> &str {
        "complete"
    }

    fn description(&self) -> &str {
        "Complete the code at point"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let path = self.ctx.resolve_file(self.options.str("file")?)?;
        let line = self.position("line")?;
        let column = self.position("column")?;
        let limit = self
            .ctx
            .storage
            .option("complete.limit")?
            .as_u64()
            .unwrap_or(50) as usize;

        let parsed = self.ctx.parse(&path)?;
        let prefix = prefix_at(&parsed.source, line, column)?;

        // Keyed by (spelling, usr) for a stable, duplicate-free listing
        let mut candidates: BTreeMap<(String, String), Candidate> = BTreeMap::new();
        let local = parsed
            .extraction
            .definitions
            .iter()
            .filter(|d| d.spelling.starts_with(prefix))
            .map(|d| Candidate {
                spelling: d.spelling.clone(),
                kind: d.kind.clone(),
                usr: d.usr.clone(),
            });
        for candidate in self.ctx.storage.complete(prefix, limit)?.into_iter().chain(local) {
            candidates
                .entry((candidate.spelling.clone(), candidate.usr.clone()))
                .or_insert(candidate);
        }

        for candidate in candidates.values().take(limit) {
            writeln!(out, "{}\t{}\t{}", candidate.spelling, candidate.kind, candidate.usr)?;
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::Project;
    use serde_json::json;

    #[test]
    fn test_prefix_at() {
        let source = "int main() {\n  return hel\n}\n";
        assert_eq!(prefix_at(source, 1, 12).unwrap(), "hel");
        assert_eq!(prefix_at(source, 1, 10).unwrap(), "h");
        assert_eq!(prefix_at(source, 1, 2).unwrap(), "");
        // Past the end of the line clamps
        assert_eq!(prefix_at(source, 1, 99).unwrap(), "hel");
        assert!(prefix_at(source, 9, 0).is_err());
    }

    #[test]
    fn test_complete_merges_index_and_local_definitions() {
        let project = Project::new(&[
            ("lib.cpp", "int helper() { return 1; }\nint other() { return 2; }\n"),
            ("a.cpp", "int help_local() { return 0; }\nint main() { return hel\n"),
        ]);
        project.index();

        let mut complete = CompleteCommand::new(project.ctx.clone());
        complete.reset_defaults();
        for (name, value) in [("file", json!("a.cpp")), ("line", json!(1)), ("column", json!(23))] {
            complete.options_mut().assign("complete", name, &value).unwrap();
        }
        let text = project.run(&mut complete).unwrap();
        let names: Vec<&str> = text.lines().map(|l| l.split('\t').next().unwrap()).collect();
        assert_eq!(names, vec!["help_local", "helper"]);

        project.ctx.storage.set_option("complete.limit", &json!(1)).unwrap();
        let text = project.run(&mut complete).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
