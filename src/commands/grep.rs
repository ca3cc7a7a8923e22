//! `grep` — every reference to a USR.

use std::io::Write;

use super::{Context, SourceLines};
use crate::error::CommandError;
use crate::request::{Command, Flow, OptionSet, OptionSpec};

pub struct GrepCommand {
    ctx: Context,
    options: OptionSet,
}

impl GrepCommand {
    pub fn new(ctx: Context) -> Self {
        let options = OptionSet::new()
            .with(
                OptionSpec::string("usr", "c:@F@main")
                    .metavar("USR")
                    .description("Unified Symbol Resolution for the symbol"),
            )
            .with(OptionSpec::enumeration("format", &["text", "json"], "text").description("Output format"));
        Self { ctx, options }
    }
}

impl Command for GrepCommand {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Find all references to a definition"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let usr = self.options.str("usr")?;
        let references = self.ctx.storage.references_to(usr)?;

        if self.options.str("format")? == "json" {
            writeln!(out, "{}", serde_json::to_string(&references)?)?;
            return Ok(Flow::Continue);
        }

        let mut lines = SourceLines::default();
        for reference in &references {
            writeln!(
                out,
                "{}:{}:{}: {}",
                reference.file.display(),
                reference.span.line,
                reference.span.col,
                lines.line(&reference.file, reference.span.line)
            )?;
        }
        Ok(Flow::Continue)
    }
}
