//! Tunnel process supervisor
//!
//! Launches the tunnel executable for a profile and attaches a monitor task
//! to it. The monitor is the only writer of the connection's status and the
//! only place the connection is torn down:
//!
//! ```text
//!  spawn_tunnel ──► supervise ──► monitor task
//!                                   │ read stdout line
//!                                   │ append to <profile>.log
//!                                   │ classify ──► registry status
//!                                   │           └► first change: drop credentials,
//!                                   │                            fire start signal
//!                                   ▼ EOF + process exit
//!                              remove credentials, remove record
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::credentials::CredentialFile;
use crate::error::{TunsvcError, TunsvcResult};
use crate::registry::{ConnectionRegistry, ConnectionStatus, ProcessHandle};

/// Printed once the tunnel is fully up
pub const CONNECTED_MARKER: &str = "Initialization Sequence Completed";
/// Printed when the tunnel lost its peer and is restarting
pub const RECONNECTING_MARKER: &str = "Inactivity timeout";
/// Printed when the server rejected the supplied credentials
pub const AUTH_FAILED_MARKERS: [&str; 2] = ["AUTH_FAILED", "auth-failure"];

/// Map one line of tunnel output to a status change, if it carries one.
pub fn classify_line(line: &str) -> Option<ConnectionStatus> {
    if line.contains(CONNECTED_MARKER) {
        Some(ConnectionStatus::Connected)
    } else if line.contains(RECONNECTING_MARKER) {
        Some(ConnectionStatus::Reconnecting)
    } else if AUTH_FAILED_MARKERS.iter().any(|m| line.contains(m)) {
        Some(ConnectionStatus::AuthError)
    } else {
        None
    }
}

/// Per-profile log file path
pub fn log_path(config_path: &Path, extension: &str) -> PathBuf {
    config_path.with_extension(extension)
}

/// Build the tunnel command line after the configured prefix arguments.
pub fn tunnel_args(prefix: &[String], config_path: &Path, credential_path: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = prefix.iter().map(OsString::from).collect();
    args.push("--config".into());
    args.push(config_path.into());
    if let Some(path) = credential_path {
        args.push("--auth-user-pass".into());
        args.push(path.into());
    }
    args
}

/// Start the tunnel executable. Only stdout is captured.
pub(crate) fn spawn_tunnel(
    settings: &TunnelSettings,
    config_path: &Path,
    credential_path: Option<&Path>,
) -> TunsvcResult<Child> {
    let mut command = Command::new(&settings.binary);
    command
        .args(tunnel_args(&settings.args, config_path, credential_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(windows)]
    command.creation_flags(crate::command::CREATE_NO_WINDOW);

    let child = command.spawn().map_err(|source| TunsvcError::SpawnFailed {
        binary: settings.binary.display().to_string(),
        source,
    })?;

    debug!("Spawned {:?} (PID: {:?})", settings.binary, child.id());
    Ok(child)
}

/// Attach a monitor task to `child`.
///
/// Returns the handle to store in the connection record and the receiver for
/// the first status change. The receiver errors if the process exits before
/// printing any recognized marker.
pub(crate) fn supervise(
    id: String,
    child: Child,
    log_path: PathBuf,
    credentials: Option<CredentialFile>,
    registry: Arc<ConnectionRegistry>,
) -> (ProcessHandle, oneshot::Receiver<ConnectionStatus>) {
    let (stop_tx, stop_rx) = mpsc::unbounded_channel();
    let (started_tx, started_rx) = oneshot::channel();
    let handle = ProcessHandle::new(child.id(), stop_tx);

    let monitor = Monitor {
        lines: LineHandler {
            id,
            registry,
            credentials,
            started: Some(started_tx),
            log: None,
            log_path,
        },
        child,
        stop_rx,
        stop_open: true,
    };
    tokio::spawn(monitor.run());

    (handle, started_rx)
}

struct Monitor {
    lines: LineHandler,
    child: Child,
    stop_rx: mpsc::UnboundedReceiver<()>,
    stop_open: bool,
}

impl Monitor {
    async fn run(mut self) {
        self.lines.open_log().await;

        if let Some(stdout) = self.child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();

            loop {
                tokio::select! {
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            self.lines.handle(&buf).await;
                            buf.clear();
                        }
                        Err(e) => {
                            warn!("Connection {}: failed to read tunnel output: {}", self.lines.id, e);
                            break;
                        }
                    },
                    msg = self.stop_rx.recv(), if self.stop_open => self.on_stop_message(msg),
                }
            }
        }

        // Output closed; the process may still be running until it notices.
        loop {
            tokio::select! {
                status = self.child.wait() => {
                    match status {
                        Ok(status) => info!("Connection {}: tunnel exited with {}", self.lines.id, status),
                        Err(e) => warn!("Connection {}: failed to wait for tunnel: {}", self.lines.id, e),
                    }
                    break;
                }
                msg = self.stop_rx.recv(), if self.stop_open => self.on_stop_message(msg),
            }
        }

        self.lines.finish().await;
    }

    fn on_stop_message(&mut self, msg: Option<()>) {
        match msg {
            Some(()) => terminate(&mut self.child, &self.lines.id),
            None => self.stop_open = false,
        }
    }
}

/// Ask the tunnel to shut down gracefully.
fn terminate(child: &mut Child, id: &str) {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            return;
        };
        info!("Connection {}: sending SIGTERM to tunnel (PID: {})", id, pid);
        // SAFETY: pid belongs to a child we have not reaped yet.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            warn!("Connection {}: SIGTERM failed: {}", id, std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    {
        info!("Connection {}: terminating tunnel", id);
        if let Err(e) = child.start_kill() {
            warn!("Connection {}: failed to terminate tunnel: {}", id, e);
        }
    }
}

/// Per-line work of the monitor
struct LineHandler {
    id: String,
    registry: Arc<ConnectionRegistry>,
    credentials: Option<CredentialFile>,
    started: Option<oneshot::Sender<ConnectionStatus>>,
    log: Option<File>,
    log_path: PathBuf,
}

impl LineHandler {
    async fn open_log(&mut self) {
        match File::create(&self.log_path).await {
            Ok(file) => self.log = Some(file),
            Err(e) => warn!("Connection {}: cannot open log {:?}: {}", self.id, self.log_path, e),
        }
    }

    async fn handle(&mut self, raw: &[u8]) {
        self.append_log(raw).await;

        let line = String::from_utf8_lossy(raw);
        let Some(status) = classify_line(&line) else {
            return;
        };

        self.registry.set_status(&self.id, status).await;

        // The tunnel has read its credentials by the time it reports anything.
        if let Some(credentials) = self.credentials.take() {
            credentials.discard().await;
        }

        if let Some(started) = self.started.take() {
            info!("Connection {}: {}", self.id, status);
            let _ = started.send(status);
        } else {
            debug!("Connection {}: {}", self.id, status);
        }
    }

    async fn append_log(&mut self, raw: &[u8]) {
        let Some(log) = self.log.as_mut() else {
            return;
        };

        let result = match log.write_all(raw).await {
            Ok(()) => log.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Connection {}: log {:?} write failed, logging disabled: {}", self.id, self.log_path, e);
            self.log = None;
        }
    }

    async fn finish(mut self) {
        if let Some(mut log) = self.log.take() {
            let _ = log.flush().await;
        }
        if let Some(credentials) = self.credentials.take() {
            credentials.discard().await;
        }
        self.registry.remove(&self.id).await;
    }
}
