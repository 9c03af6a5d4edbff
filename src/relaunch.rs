//! Starting the successor process.
//!
//! Two strategies share one contract:
//!
//! * [`InheritStrategy`] spawns a sibling that takes over and tells the
//!   predecessor to exit once it accepts.
//! * [`ExecStrategy`] spawns a temporary successor, then the predecessor
//!   drains and execs the new binary in place, keeping its pid. The new
//!   image retires the temporary successor.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::handoff::{set_cloexec, Envelope, Predecessor};
use crate::listener::Listener;
use crate::signals::{self, RestartSignal};

#[derive(Error, Debug)]
pub enum RelaunchError {
    #[error("Unable to find executable {path:?}: {reason}")]
    ExecutableNotFound { path: PathBuf, reason: String },
    #[error("Unable to read the working directory: {0}")]
    WorkingDirectory(#[source] io::Error),
    #[error("Unable to prepare the listener for handoff: {0}")]
    Encode(#[source] io::Error),
    #[error("Unable to spawn successor: {0}")]
    Spawn(#[source] io::Error),
    #[error("Unable to exec {path:?}: {source}")]
    Exec { path: PathBuf, source: io::Error },
}

/// A successor that has been started but has not finished the handshake.
#[derive(Debug)]
pub struct ChildProcess {
    pub pid: u32,
    pub spawned_at: Instant,
    handle: Option<tokio::process::Child>,
}

impl ChildProcess {
    /// A successor known only by pid.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            spawned_at: Instant::now(),
            handle: None,
        }
    }

    /// Whether the successor is known to have died already.
    pub fn has_exited(&mut self) -> bool {
        match self.handle.as_mut().map(|child| child.try_wait()) {
            Some(Ok(Some(status))) => {
                warn!(pid = self.pid, %status, "successor exited");
                true
            }
            _ => false,
        }
    }
}

/// How a restart is carried out.
pub trait Strategy: Send + Sync + fmt::Debug {
    /// Predecessor side: start a successor that inherits `listener`.
    fn spawn_successor(&self, listener: &Listener) -> Result<ChildProcess, RelaunchError>;

    /// Successor side, once accepting: tell the predecessor.
    fn confirm_ready(&self, predecessor: &Predecessor) -> io::Result<()> {
        match predecessor.ready_signal {
            RestartSignal::GracefulExit => self.signal_predecessor_exit(predecessor.ready_pid),
            sig => signals::send(predecessor.ready_pid, sig),
        }
    }

    fn signal_predecessor_exit(&self, pid: u32) -> io::Result<()> {
        info!(pid, "asking predecessor to exit");
        signals::send(pid, RestartSignal::GracefulExit)
    }

    /// Whether a restart signal received while a successor is pending is
    /// that successor reporting readiness, meaning this process should
    /// drain and exec.
    ///
    /// Signals carry no sender, so an operator's second SIGUSR2 during that
    /// window is indistinguishable from the successor's and triggers the
    /// exec early. The successor's own SIGUSR2 then reaches the new image
    /// and starts another restart. Send SIGUSR2 once per upgrade.
    fn reexec_on_ready(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct InheritStrategy;

impl Strategy for InheritStrategy {
    fn spawn_successor(&self, listener: &Listener) -> Result<ChildProcess, RelaunchError> {
        relaunch(listener, RestartSignal::GracefulExit)
    }
}

#[derive(Debug, Default)]
pub struct ExecStrategy;

impl Strategy for ExecStrategy {
    fn spawn_successor(&self, listener: &Listener) -> Result<ChildProcess, RelaunchError> {
        relaunch(listener, RestartSignal::BeginRestart)
    }

    fn confirm_ready(&self, predecessor: &Predecessor) -> io::Result<()> {
        if predecessor.ready_pid == predecessor.parent_pid {
            // Temporary successor: the parent is waiting to exec.
            info!(pid = predecessor.parent_pid, "reporting readiness to predecessor");
            return signals::send(predecessor.parent_pid, predecessor.ready_signal);
        }

        // Fresh image after exec: the temporary successor is our child.
        self.signal_predecessor_exit(predecessor.ready_pid)?;
        reap(predecessor.ready_pid);

        Ok(())
    }

    fn reexec_on_ready(&self) -> bool {
        true
    }
}

/// Strategy names as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Inherit,
    Exec,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn Strategy> {
        match self {
            Self::Inherit => Arc::new(InheritStrategy),
            Self::Exec => Arc::new(ExecStrategy),
        }
    }
}

/// Spawn a copy of the running binary that inherits `listener` and sends
/// `ready_signal` to this process once it accepts.
pub fn relaunch(
    listener: &Listener,
    ready_signal: RestartSignal,
) -> Result<ChildProcess, RelaunchError> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let cwd = std::env::current_dir().map_err(RelaunchError::WorkingDirectory)?;
    let exe = resolve_executable(argv.first().map(OsString::as_os_str), &cwd)?;

    let envelope = Envelope::encode(listener)
        .map_err(RelaunchError::Encode)?
        .with_ready(None, ready_signal);

    let spawned = tokio::process::Command::from(successor_command(&exe, &argv, &cwd, &envelope))
        .kill_on_drop(false)
        .spawn();

    // Only the successor needed the descriptor to survive exec.
    if let Err(e) = set_cloexec(envelope.fd, true) {
        warn!(fd = envelope.fd, error = %e, "unable to restore close-on-exec");
    }

    let child = spawned.map_err(RelaunchError::Spawn)?;
    let pid = child.id().ok_or_else(|| {
        RelaunchError::Spawn(io::Error::new(
            io::ErrorKind::Other,
            "successor exited immediately",
        ))
    })?;

    info!(pid, exe = %exe.display(), name = %envelope.name, "spawned successor");

    Ok(ChildProcess {
        pid,
        spawned_at: Instant::now(),
        handle: Some(child),
    })
}

/// Replace this process image with the binary on disk, handing `listener`
/// to the new image and asking it to retire `successor_pid`.
///
/// Only returns if the exec failed.
pub fn replace_image(listener: &Listener, successor_pid: u32) -> RelaunchError {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return RelaunchError::WorkingDirectory(e),
    };
    let exe = match resolve_executable(argv.first().map(OsString::as_os_str), &cwd) {
        Ok(exe) => exe,
        Err(e) => return e,
    };

    // Exec keeps our pid and our parent, so the new image validates against
    // the parent we have now.
    let parent = unsafe { libc::getppid() } as u32;
    let envelope = match Envelope::encode(listener) {
        Ok(envelope) => envelope
            .with_parent(parent)
            .with_ready(Some(successor_pid), RestartSignal::GracefulExit),
        Err(e) => return RelaunchError::Encode(e),
    };

    info!(exe = %exe.display(), successor_pid, "replacing process image");

    let source = successor_command(&exe, &argv, &cwd, &envelope).exec();

    if let Err(e) = set_cloexec(envelope.fd, true) {
        warn!(fd = envelope.fd, error = %e, "unable to restore close-on-exec");
    }

    RelaunchError::Exec { path: exe, source }
}

/// Find the binary to start. `argv[0]` is preferred over `/proc/self/exe`
/// so that a binary replaced on disk is the one that runs next.
pub fn resolve_executable(argv0: Option<&OsStr>, cwd: &Path) -> Result<PathBuf, RelaunchError> {
    let argv0 = argv0.ok_or_else(|| RelaunchError::ExecutableNotFound {
        path: PathBuf::new(),
        reason: "argv[0] is empty".to_string(),
    })?;
    let path = Path::new(argv0);

    let candidate = if path.components().count() > 1 {
        cwd.join(path)
    } else {
        which::which(argv0).map_err(|e| RelaunchError::ExecutableNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    match std::fs::metadata(&candidate) {
        Ok(meta) if meta.is_file() => Ok(candidate),
        Ok(_) => Err(RelaunchError::ExecutableNotFound {
            path: candidate,
            reason: "not a regular file".to_string(),
        }),
        Err(e) => Err(RelaunchError::ExecutableNotFound {
            path: candidate,
            reason: e.to_string(),
        }),
    }
}

fn successor_command(exe: &Path, argv: &[OsString], cwd: &Path, envelope: &Envelope) -> Command {
    let mut cmd = Command::new(exe);

    if let Some(arg0) = argv.first() {
        cmd.arg0(arg0);
    }

    cmd.args(argv.iter().skip(1))
        .current_dir(cwd)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    for (key, value) in envelope.vars() {
        match value {
            Some(value) => cmd.env(key, value),
            None => cmd.env_remove(key),
        };
    }

    cmd
}

/// Collect the exit status of a child inherited across exec, which no
/// tokio handle knows about.
fn reap(pid: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));

        loop {
            interval.tick().await;

            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };

            match ret {
                0 => continue,
                -1 => {
                    debug!(pid, error = %io::Error::last_os_error(), "stopped waiting for successor");
                    break;
                }
                _ => {
                    info!(pid, status, "temporary successor exited");
                    break;
                }
            }
        }
    });
}
