//! Socket server: one connection at a time, one request per connection.

use std::any::Any;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::error::{Result, TagsError};
use crate::request::{Dispatcher, Mode, Outcome};

/// Bound on how long a connection may stall the server while it sends its
/// request or closes.
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The pid file and the socket, claimed for the lifetime of the server.
///
/// Both are removed on drop, whichever way `serve` returns.
pub struct DiscoveryFiles {
    pid_file: PathBuf,
    socket_file: PathBuf,
}

impl DiscoveryFiles {
    /// Refuses when the pid file names a live process; clears a stale socket.
    pub fn claim(pid_file: &Path, socket_file: &Path) -> Result<Self> {
        if let Some(pid) = running_pid(pid_file) {
            return Err(TagsError::AlreadyRunning(pid));
        }
        if socket_file.exists() {
            debug!(socket = %socket_file.display(), "removing stale socket");
            fs::remove_file(socket_file)?;
        }

        fs::write(pid_file, format!("{}\n", std::process::id()))?;
        Ok(Self {
            pid_file: pid_file.to_path_buf(),
            socket_file: socket_file.to_path_buf(),
        })
    }

    /// Bind the socket, readable and writable by the owner only.
    pub fn bind(&self) -> Result<UnixListener> {
        let listener = UnixListener::bind(&self.socket_file)?;
        fs::set_permissions(&self.socket_file, fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }
}

impl Drop for DiscoveryFiles {
    fn drop(&mut self) {
        for path in [&self.socket_file, &self.pid_file] {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "cannot remove discovery file");
            }
        }
        info!("server exiting");
    }
}

/// Accept loop. Returns after `exit`, on an accept error, or when a
/// command panics.
pub fn serve(config: &DaemonConfig, dispatcher: &mut Dispatcher) -> Result<()> {
    let files = DiscoveryFiles::claim(&config.pid_file, &config.socket_file)?;
    let listener = files.bind()?;
    info!(
        pid = std::process::id(),
        socket = %config.socket_file.display(),
        "server listening"
    );

    loop {
        let (stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                return Err(e.into());
            }
        };
        debug!("connection accepted");

        match catch_unwind(AssertUnwindSafe(|| handle_connection(dispatcher, &stream))) {
            Ok(Ok(Outcome::Exit)) => break,
            Ok(Ok(outcome)) => debug!(?outcome, "connection closed"),
            Ok(Err(e)) => warn!(error = %e, "connection failed"),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "command panicked, shutting down");
                return Err(TagsError::Internal(message));
            }
        }
    }

    drop(files);
    Ok(())
}

/// One request, one response. The read side is drained before the stream
/// is dropped; unread bytes would reset the client's end.
fn handle_connection(dispatcher: &mut Dispatcher, stream: &UnixStream) -> std::io::Result<Outcome> {
    stream.set_read_timeout(Some(CONNECTION_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut writer = BufWriter::new(stream);
    let outcome = dispatcher.dispatch_one(&mut reader, &mut writer, Mode::Connection)?;
    writer.flush()?;
    drop(writer);
    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!(error = %e, "client already gone");
        return Ok(outcome);
    }

    if let Err(e) = std::io::copy(&mut reader, &mut std::io::sink()) {
        debug!(error = %e, "client did not close its side");
    }
    Ok(outcome)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pid recorded in `pid_file`, if that process is alive.
pub fn running_pid(pid_file: &Path) -> Option<i32> {
    let content = fs::read_to_string(pid_file).ok()?;
    let pid = content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)?;

    // Signal 0 only checks existence; EPERM means alive but not ours
    // SAFETY: kill with signal 0 sends nothing and touches no memory
    let alive = unsafe { libc::kill(pid, 0) == 0 }
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive.then_some(pid)
}

pub fn is_daemon_running(pid_file: &Path) -> bool {
    running_pid(pid_file).is_some()
}

/// Send one request and return everything the daemon wrote back.
pub fn send_request(socket: &Path, request: &serde_json::Value) -> Result<String> {
    let mut stream = UnixStream::connect(socket)?;
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_writes_pid_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join(".ct.pid");
        let socket_file = dir.path().join(".ct.sock");
        fs::write(&socket_file, "stale").unwrap();

        let files = DiscoveryFiles::claim(&pid_file, &socket_file).unwrap();
        assert!(!socket_file.exists());
        assert_eq!(running_pid(&pid_file), Some(std::process::id() as i32));

        let _listener = files.bind().unwrap();
        let mode = fs::metadata(&socket_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(files);
        assert!(!socket_file.exists());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_claim_refuses_live_pid() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join(".ct.pid");
        fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();

        let err = DiscoveryFiles::claim(&pid_file, &dir.path().join(".ct.sock")).err().unwrap();
        assert_eq!(err.code(), "ALREADY_RUNNING");
    }

    #[test]
    fn test_running_pid_ignores_garbage() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join(".ct.pid");
        assert_eq!(running_pid(&pid_file), None);
        fs::write(&pid_file, "not a pid").unwrap();
        assert!(!is_daemon_running(&pid_file));
        fs::write(&pid_file, "0").unwrap();
        assert!(!is_daemon_running(&pid_file));
    }

    #[test]
    fn test_many_requests_each_get_their_reply() {
        use crate::request::{Command, Flow, OptionSet, OptionSpec};
        use crate::error::CommandError;
        use serde_json::json;

        struct Echo(OptionSet);

        impl Command for Echo {
            fn name(&self) -> &str {
                "echo"
            }

            fn description(&self) -> &str {
                "writes its argument back"
            }

            fn options(&self) -> &OptionSet {
                &self.0
            }

            fn options_mut(&mut self) -> &mut OptionSet {
                &mut self.0
            }

            fn run(&mut self, out: &mut dyn Write) -> std::result::Result<Flow, CommandError> {
                let n = self.0.int("n")?;
                if n < 0 {
                    writeln!(out, "bye")?;
                    return Ok(Flow::Exit);
                }
                writeln!(out, "{n}")?;
                Ok(Flow::Continue)
            }
        }

        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            watch: false,
            ..DaemonConfig::default()
        }
        .resolve(dir.path());
        let socket = config.socket_file.clone();

        let server = std::thread::spawn(move || {
            let mut dispatcher = Dispatcher::new();
            dispatcher
                .register(Box::new(Echo(OptionSet::new().with(OptionSpec::int("n", 0)))))
                .unwrap();
            serve(&config, &mut dispatcher)
        });
        while !socket.exists() {
            std::thread::sleep(Duration::from_millis(10));
        }

        for n in 0..300 {
            let reply = send_request(&socket, &json!({"command": "echo", "n": n})).unwrap();
            assert_eq!(reply, format!("{n}\n"));
        }
        // A malformed request is answered and the server keeps going
        let reply = send_request(&socket, &json!(["not", "an", "object"])).unwrap();
        assert!(reply.contains("\"status\":\"error\""), "{reply}");

        assert_eq!(send_request(&socket, &json!({"command": "echo", "n": -1})).unwrap(), "bye\n");
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_panic_message() {
        let panic = catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom 1");
    }
}
