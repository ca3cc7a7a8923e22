//! `config` — get or set a persisted option.

use serde_json::Value;
use std::io::Write;

use super::Context;
use crate::error::CommandError;
use crate::request::{Command, Flow, OptionSet, OptionSpec};
use crate::storage::OPTION_NAMES;

pub struct ConfigCommand {
    ctx: Context,
    options: OptionSet,
}

impl ConfigCommand {
    pub fn new(ctx: Context) -> Self {
        let options = OptionSet::new()
            .with(
                OptionSpec::bool("get", false)
                    .description("if true, get the option value. Otherwise, set it"),
            )
            .with(OptionSpec::string("option", "").metavar("NAME").description("option name"))
            .with(
                OptionSpec::json("value", Value::Null)
                    .metavar("JSON_VAL")
                    .description("JSON-encoded option value"),
            );
        Self { ctx, options }
    }
}

impl Command for ConfigCommand {
    fn name(&self) -> &str {
        "config"
    }

    fn description(&self) -> &str {
        "Get/set sourcetags configuration"
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let get = self.options.bool("get")?;
        let name = self.options.str("option")?;

        if get {
            if name.is_empty() {
                for name in OPTION_NAMES {
                    writeln!(out, "{name} = {}", self.ctx.storage.option(name)?)?;
                }
            } else {
                writeln!(out, "{}", self.ctx.storage.option(name)?)?;
            }
            return Ok(Flow::Continue);
        }

        if name.is_empty() {
            return Err(CommandError::InvalidArgument("option is required".to_string()));
        }
        let value = self.options.json("value")?;
        if value.is_null() {
            return Err(CommandError::InvalidArgument(format!("no value given for {name}")));
        }
        self.ctx.storage.set_option(name, value)?;
        writeln!(out, "{name} = {value}")?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::Project;
    use serde_json::json;

    fn configure(project: &Project, values: &[(&str, Value)]) -> Result<String, CommandError> {
        let mut config = ConfigCommand::new(project.ctx.clone());
        config.reset_defaults();
        for (name, value) in values {
            config.options_mut().assign("config", name, value).unwrap();
        }
        project.run(&mut config)
    }

    #[test]
    fn test_set_then_get() {
        let project = Project::new(&[]);
        let text = configure(&project, &[("option", json!("complete.limit")), ("value", json!(5))]).unwrap();
        assert_eq!(text, "complete.limit = 5\n");

        let text = configure(&project, &[("get", json!(true)), ("option", json!("complete.limit"))]).unwrap();
        assert_eq!(text, "5\n");

        let text = configure(&project, &[("get", json!(true))]).unwrap();
        assert!(text.contains("index.exclude = []"));
        assert!(text.contains("complete.limit = 5"));
    }

    #[test]
    fn test_rejections() {
        let project = Project::new(&[]);
        let err = configure(&project, &[("option", json!("complete.limit")), ("value", json!("x"))]).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG_VALUE");

        let err = configure(&project, &[("option", json!("nope")), ("value", json!(1))]).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CONFIG_OPTION");

        let err = configure(&project, &[("option", json!("complete.limit"))]).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
