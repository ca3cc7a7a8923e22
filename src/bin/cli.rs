//! sourcetags CLI - source code indexing daemon and its client.
//!
//! Usage:
//!   sourcetags serve                  # Run the daemon on .ct.sock
//!   sourcetags serve --stdin          # Execute one request from stdin and exit
//!   sourcetags shell                  # Interactive prompt, no socket
//!   sourcetags send find file=a.cpp offset=120
//!   sourcetags status                 # Is a daemon running here?
//!   sourcetags stop                   # Ask the daemon to exit
//!   sourcetags commands               # List commands and their options

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use sourcetags::request::Outcome;
use sourcetags::{is_daemon_running, send_request, Daemon, DaemonConfig, Request, Response, Storage};

#[derive(Parser)]
#[command(name = "sourcetags")]
#[command(about = "sourcetags - keeps a C/C++ source index fresh and answers queries", long_about = None)]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Serve {
        /// Read a request from the standard input and exit
        #[arg(short, long)]
        stdin: bool,
    },

    /// Interactive command prompt on the terminal
    Shell,

    /// Send one request to a running daemon
    Send {
        /// Command name (load, config, index, find, grep, complete, exit)
        command: String,

        /// Options as name=value; values are parsed as JSON, else taken as strings
        args: Vec<String>,
    },

    /// Report whether a daemon is running for this project
    Status,

    /// Ask the running daemon to exit
    Stop,

    /// List commands and their options
    Commands,
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sourcetags=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.canonicalize().unwrap_or(cli.root);
    let config = DaemonConfig::load(&root)?.resolve(&root);

    match cli.command {
        Commands::Serve { stdin: true } => {
            let daemon = Daemon::open(&root, config)?;
            let stdin = io::stdin();
            let stdout = io::stdout();
            match daemon.serve_one(&mut stdin.lock(), &mut stdout.lock())? {
                Outcome::Rejected(_) => Ok(1),
                _ => Ok(0),
            }
        }

        Commands::Serve { stdin: false } => {
            let daemon = Daemon::open(&root, config)?;
            daemon.serve()?;
            Ok(0)
        }

        Commands::Shell => {
            let daemon = Daemon::open(&root, config)?;
            daemon.shell()?;
            Ok(0)
        }

        Commands::Send { command, args } => {
            let mut request = Request::new(command);
            for arg in &args {
                let (name, value) = parse_arg(arg)?;
                request = request.with(name, value);
            }
            send(&config.socket_file, &request)
        }

        Commands::Status => {
            let running = is_daemon_running(&config.pid_file);
            if running {
                println!("running (socket {})", config.socket_file.display());
            } else {
                println!("not running");
            }
            if config.database.exists() {
                let counts = Storage::open(&config.database)?.counts()?;
                println!(
                    "index: {} files, {} commands, {} definitions, {} references",
                    counts.files, counts.commands, counts.definitions, counts.references
                );
            }
            Ok(if running { 0 } else { 1 })
        }

        Commands::Stop => {
            if !is_daemon_running(&config.pid_file) {
                println!("not running");
                return Ok(0);
            }
            send(&config.socket_file, &Request::new("exit"))
        }

        Commands::Commands => {
            let offline = DaemonConfig {
                watch: false,
                ..config
            };
            let storage = Arc::new(Storage::in_memory()?);
            let daemon = Daemon::with_storage(root, offline, storage)?;
            print!("{}", daemon.dispatcher()?.usage());
            Ok(0)
        }
    }
}

/// `name=value`, where `value` is JSON when it parses as JSON.
fn parse_arg(arg: &str) -> Result<(String, Value)> {
    let Some((name, raw)) = arg.split_once('=') else {
        bail!("expected name=value, got {arg:?}");
    };
    if name.is_empty() {
        bail!("empty option name in {arg:?}");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

fn send(socket: &Path, request: &Request) -> Result<i32> {
    let response = send_request(socket, &request.to_value())
        .with_context(|| format!("cannot reach daemon at {}", socket.display()))?;
    print!("{response}");

    let failed = response
        .lines()
        .last()
        .and_then(Response::parse)
        .is_some_and(|r| matches!(r, Response::Error { .. }));
    Ok(if failed { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("offset=120").unwrap(), ("offset".to_string(), json!(120)));
        assert_eq!(parse_arg("file=a.cpp").unwrap(), ("file".to_string(), json!("a.cpp")));
        assert_eq!(parse_arg("value=[\"x\"]").unwrap().1, json!(["x"]));
        assert_eq!(parse_arg("usr=c:@F@main=1").unwrap().1, json!("c:@F@main=1"));
        assert!(parse_arg("offset").is_err());
        assert!(parse_arg("=1").is_err());
    }
}
