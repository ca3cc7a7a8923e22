//! `load` — read a JSON compilation database into the store.

use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::Context;
use crate::error::CommandError;
use crate::request::{Command, Flow, OptionSet, OptionSpec};
use crate::storage::CompileCommand;
use crate::update::RebuildTrigger;

/// One entry of `compile_commands.json`. Either `arguments` or `command` is present.
#[derive(Debug, Deserialize)]
struct DatabaseEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    command: Option<String>,
}

/// Splits a shell command line on whitespace, honoring quotes and backslashes.
fn split_command(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            (Some(_), c) => word.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    word.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (None, c) => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

fn to_command(index: usize, entry: DatabaseEntry) -> Result<CompileCommand, CommandError> {
    let arguments = match (entry.arguments, entry.command) {
        (Some(arguments), _) => arguments,
        (None, Some(command)) => split_command(&command),
        (None, None) => {
            return Err(CommandError::InvalidArgument(format!(
                "entry {index} has neither \"arguments\" nor \"command\""
            )))
        }
    };
    let file = entry.directory.join(&entry.file);
    let file = file.canonicalize().unwrap_or(file);
    Ok(CompileCommand {
        file,
        directory: entry.directory,
        arguments,
    })
}

pub struct LoadCommand {
    ctx: Context,
    options: OptionSet,
}

impl LoadCommand {
    pub fn new(ctx: Context) -> Self {
        let options = OptionSet::new().with(
            OptionSpec::string("database", "compile_commands.json")
                .metavar("FILEPATH")
                .description("Load compilation commands from a JSON compilation database"),
        );
        Self { ctx, options }
    }

    fn load(&self, path: &Path) -> Result<usize, CommandError> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CommandError::FileNotFound(path.to_path_buf()),
            _ => CommandError::Io(e),
        })?;
        let entries: Vec<DatabaseEntry> = serde_json::from_str(&text)?;

        let count = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            let command = to_command(index, entry)?;
            self.ctx.storage.set_compile_command(&command)?;
        }
        Ok(count)
    }
}

impl Command for LoadCommand {
    fn name(&self) -> &str {
        "load"
    }

    fn description(&self) -> &str {
        "Read a compilation database"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let path = self.ctx.root.join(self.options.str("database")?);
        let count = self.load(&path)?;
        info!(database = %path.display(), entries = count, "compilation database loaded");

        // New files must be watched and indexed
        self.ctx.engine.request_rescan();
        self.ctx.engine.request_rebuild();

        writeln!(out, "Loaded {count} compile commands from {}", path.display())?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::Project;
    use serde_json::json;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"c++ -DNAME="a b" -I 'inc dir' -c  a.cpp"#),
            vec!["c++", "-DNAME=a b", "-I", "inc dir", "-c", "a.cpp"]
        );
        assert_eq!(split_command(r"cc a\ b.c"), vec!["cc", "a b.c"]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_load_registers_entries() {
        let project = Project::new(&[]);
        fs::write(project.root.join("a.cpp"), "int a;\n").unwrap();
        let database = json!([
            {"directory": project.root, "file": "a.cpp", "arguments": ["c++", "-c", "a.cpp"]},
            {"directory": project.root, "file": "b.cpp", "command": "c++ -Iinc -c b.cpp"}
        ]);
        fs::write(project.root.join("compile_commands.json"), database.to_string()).unwrap();

        let mut load = LoadCommand::new(project.ctx.clone());
        let text = project.run(&mut load).unwrap();
        assert!(text.starts_with("Loaded 2 compile commands"));

        let commands = project.ctx.storage.compile_commands().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].file, project.root.join("a.cpp"));
        assert_eq!(commands[1].include_dirs(), vec![project.root.join("inc")]);

        // A rebuild is now pending
        assert!(project.ctx.engine.state().requested_generation > project.ctx.engine.generation());
    }

    #[test]
    fn test_load_errors() {
        let project = Project::new(&[]);
        let mut load = LoadCommand::new(project.ctx.clone());
        assert_eq!(project.run(&mut load).unwrap_err().code(), "FILE_NOT_FOUND");

        fs::write(project.root.join("compile_commands.json"), "{").unwrap();
        assert_eq!(project.run(&mut load).unwrap_err().code(), "JSON_ERROR");

        fs::write(
            project.root.join("compile_commands.json"),
            json!([{"directory": "/p", "file": "x.cpp"}]).to_string(),
        )
        .unwrap();
        assert_eq!(project.run(&mut load).unwrap_err().code(), "INVALID_ARGUMENT");
    }
}
