//! Command dispatch — binds named JSON requests to typed commands.
//!
//! ```text
//!   input ──> read one JSON value ──> Request { command, values }
//!                                        │
//!                     lookup ◄───────────┘   (UnknownCommand)
//!                       │
//!                 reset_defaults()
//!                       │
//!              assign each value   (UnknownOption / TypeMismatch / Decode)
//!                       │
//!                   run(out) ──> Flow::Continue | Flow::Exit
//! ```
//!
//! Binding and execution errors become one JSON error line on the output;
//! they never end the dispatcher. Only `Flow::Exit` does.

pub mod options;
pub mod protocol;

pub use options::{OptionSet, OptionSpec, OptionValue};
pub use protocol::{Request, Response};

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

use crate::error::{CommandError, RequestError};

/// Prompt shown before any command has been dispatched.
pub const DEFAULT_PROMPT: &str = "sourcetags> ";

/// What a command asks the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Termination signal: stop the interactive loop or the server.
    Exit,
}

/// A named request handler with typed options.
pub trait Command {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn prompt(&self) -> String {
        format!("{}> ", self.name())
    }

    fn options(&self) -> &OptionSet;

    fn options_mut(&mut self) -> &mut OptionSet;

    /// Called before every binding.
    fn reset_defaults(&mut self) {
        self.options_mut().reset();
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<Flow, CommandError>;
}

/// Where requests come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A terminal or pipe carrying one request per line. After a malformed
    /// request the rest of its line is discarded.
    Lines,
    /// A socket connection carrying one request. Requests are logged, and
    /// nothing more is read after a malformed one.
    Connection,
}

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Served,
    /// An error response was written.
    Rejected(&'static str),
    EndOfInput,
    Exit,
}

#[derive(Default)]
pub struct Dispatcher {
    commands: BTreeMap<String, Box<dyn Command>>,
    active: Option<String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Box<dyn Command>) -> Result<(), RequestError> {
        let name = command.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(RequestError::DuplicateCommand(name));
        }
        debug!(command = %name, options = command.options().len(), "command registered");
        self.commands.insert(name, command);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    /// Prompt of the last dispatched command.
    pub fn prompt(&self) -> String {
        self.active
            .as_ref()
            .and_then(|name| self.commands.get(name))
            .map(|c| c.prompt())
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string())
    }

    /// Currently bound option values of a command.
    pub fn options_of(&self, name: &str) -> Option<Map<String, Value>> {
        self.commands.get(name).map(|c| c.options().snapshot())
    }

    pub fn usage(&self) -> String {
        let mut text = String::from("Commands:\n");
        for command in self.commands.values() {
            text.push_str(&format!("  {:<10} {}\n", command.name(), command.description()));
            for option in command.options().iter() {
                text.push_str(&format!("      {}\n", option.usage()));
            }
        }
        text
    }

    /// Read, bind and execute exactly one request.
    ///
    /// Returns `Err` only for I/O failures on `out`.
    pub fn dispatch_one<R, W>(&mut self, input: &mut R, out: &mut W, mode: Mode) -> io::Result<Outcome>
    where
        R: BufRead + ?Sized,
        W: Write + ?Sized,
    {
        let value = match read_value(input) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Outcome::EndOfInput),
            Err(e) => {
                if mode == Mode::Lines {
                    let mut rest = String::new();
                    let _ = input.read_line(&mut rest);
                }
                return reject(out, e.code(), &e.to_string());
            }
        };

        if mode == Mode::Connection {
            info!(request = %value, "request received");
        }

        let request = match Request::from_value(value) {
            Ok(request) => request,
            Err(e) => return reject(out, e.code(), &e.to_string()),
        };

        let command = match self.bind(&request) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %request.command, code = e.code(), error = %e, "request rejected");
                return reject(out, e.code(), &e.to_string());
            }
        };

        let mut writer = DynWriter(&mut *out);
        match command.run(&mut writer) {
            Ok(Flow::Continue) => {
                out.flush()?;
                Ok(Outcome::Served)
            }
            Ok(Flow::Exit) => {
                out.flush()?;
                info!(command = %request.command, "termination requested");
                Ok(Outcome::Exit)
            }
            Err(CommandError::Io(e)) => Err(e),
            Err(e) => {
                warn!(command = %request.command, code = e.code(), error = %e, "command failed");
                reject(out, e.code(), &e.to_string())
            }
        }
    }

    /// Prompt, dispatch, repeat until `exit` or end of input.
    pub fn run_interactive<R, W>(&mut self, input: &mut R, out: &mut W) -> io::Result<Outcome>
    where
        R: BufRead + ?Sized,
        W: Write + ?Sized,
    {
        loop {
            write!(out, "{}", self.prompt())?;
            out.flush()?;
            match self.dispatch_one(input, out, Mode::Lines)? {
                Outcome::Exit => return Ok(Outcome::Exit),
                Outcome::EndOfInput => {
                    writeln!(out)?;
                    return Ok(Outcome::EndOfInput);
                }
                Outcome::Served | Outcome::Rejected(_) => {}
            }
        }
    }

    fn bind(&mut self, request: &Request) -> Result<&mut Box<dyn Command>, RequestError> {
        if !self.commands.contains_key(&request.command) {
            return Err(RequestError::UnknownCommand {
                name: request.command.clone(),
                available: self.names().join(", "),
            });
        }
        self.active = Some(request.command.clone());

        let command = self
            .commands
            .get_mut(&request.command)
            .ok_or_else(|| RequestError::Undeclared(request.command.clone()))?;
        command.reset_defaults();
        for (name, raw) in &request.values {
            command.options_mut().assign(&request.command, name, raw)?;
        }
        Ok(command)
    }
}

/// Adapter so generic writers can be handed to `Command::run`.
struct DynWriter<'a, W: Write + ?Sized>(&'a mut W);

impl<W: Write + ?Sized> Write for DynWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn reject<W: Write + ?Sized>(out: &mut W, code: &'static str, message: &str) -> io::Result<Outcome> {
    let line = serde_json::to_string(&Response::error(code, message))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(Outcome::Rejected(code))
}

/// Next JSON value from `input`; `None` when only whitespace remains.
fn read_value<R: BufRead + ?Sized>(input: &mut R) -> Result<Option<Value>, RequestError> {
    let mut stream = serde_json::Deserializer::from_reader(input).into_iter::<Value>();
    match stream.next() {
        None => Ok(None),
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) if e.is_eof() => {
            debug!(error = %e, "input ended inside a request");
            Err(RequestError::MalformedRequest(format!("incomplete request: {e}")))
        }
        Some(Err(e)) => Err(RequestError::MalformedRequest(e.to_string())),
    }
}
