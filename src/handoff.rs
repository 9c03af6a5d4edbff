//! Carrying a listening socket across a process boundary.
//!
//! The predecessor clears close-on-exec on the listener and describes it in
//! a handful of environment variables. The successor finds the descriptor
//! at the same number, checks that the variables were really meant for it,
//! and adopts the socket without ever closing or rebinding it.

use socket2::{Socket, Type};
use thiserror::Error;
use tracing::{debug, info};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::listener::Listener;
use crate::signals::RestartSignal;

pub const FD_VAR: &str = "GOAGAIN_FD";
pub const NAME_VAR: &str = "GOAGAIN_NAME";
pub const PPID_VAR: &str = "GOAGAIN_PPID";
pub const PID_VAR: &str = "GOAGAIN_PID";
pub const SIGNAL_VAR: &str = "GOAGAIN_SIGNAL";

const VARS: [&str; 5] = [FD_VAR, NAME_VAR, PPID_VAR, PID_VAR, SIGNAL_VAR];

#[derive(Error, Debug)]
pub enum HandoffError {
    /// No handoff in the environment: this is a fresh start.
    #[error("No inherited listener in the environment.")]
    EnvironmentMissing,
    #[error("Inherited listener environment is invalid: {0}")]
    EnvironmentInvalid(String),
    #[error("GOAGAIN_PPID is {expected} but the parent process is {actual}.")]
    StaleEnvironment { expected: u32, actual: u32 },
}

/// What a predecessor tells its successor about the listener it hands over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub fd: RawFd,
    pub name: String,
    pub parent_pid: u32,
    /// Process to notify once the successor accepts. `None` means the parent.
    pub ready_pid: Option<u32>,
    pub ready_signal: RestartSignal,
}

impl Envelope {
    /// Describe `listener` for a successor and make its descriptor survive
    /// exec.
    pub fn encode(listener: &Listener) -> io::Result<Self> {
        let fd = listener.as_raw_fd();
        set_cloexec(fd, false)?;

        Ok(Self {
            fd,
            name: format!("{}->", listener.local_addr()?),
            parent_pid: std::process::id(),
            ready_pid: None,
            ready_signal: RestartSignal::GracefulExit,
        })
    }

    pub fn with_parent(mut self, pid: u32) -> Self {
        self.parent_pid = pid;
        self
    }

    pub fn with_ready(mut self, pid: Option<u32>, signal: RestartSignal) -> Self {
        self.ready_pid = pid;
        self.ready_signal = signal;
        self
    }

    /// Environment entries for the successor. `None` values must be removed
    /// so a stale entry inherited from an earlier handoff does not survive.
    pub fn vars(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            (FD_VAR, Some(self.fd.to_string())),
            (NAME_VAR, Some(self.name.clone())),
            (PPID_VAR, Some(self.parent_pid.to_string())),
            (PID_VAR, self.ready_pid.map(|pid| pid.to_string())),
            (SIGNAL_VAR, Some(self.ready_signal.as_raw().to_string())),
        ]
    }
}

/// A listener recovered from a predecessor.
#[derive(Debug)]
pub struct Inherited {
    pub listener: Listener,
    pub predecessor: Predecessor,
}

/// The process that handed the listener over, and how to tell it we are
/// accepting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predecessor {
    pub name: String,
    pub parent_pid: u32,
    pub ready_pid: u32,
    pub ready_signal: RestartSignal,
}

/// Recover the listener handed over by the parent process, if any.
///
/// The handoff variables are removed from the environment whenever they
/// were present, whether or not they turned out to be usable.
pub fn decode() -> Result<Inherited, HandoffError> {
    let vars: HashMap<String, String> = VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();

    if !vars.is_empty() {
        for key in VARS {
            std::env::remove_var(key);
        }
    }

    let parent = unsafe { libc::getppid() };
    decode_from(&vars, parent as u32)
}

/// Decode against an explicit environment and parent pid.
pub fn decode_from(
    vars: &HashMap<String, String>,
    real_parent: u32,
) -> Result<Inherited, HandoffError> {
    let fd_var = vars.get(FD_VAR).ok_or(HandoffError::EnvironmentMissing)?;

    let fd: RawFd = parse(FD_VAR, Some(fd_var))?;
    let parent_pid: u32 = parse(PPID_VAR, vars.get(PPID_VAR))?;
    let name = vars.get(NAME_VAR).cloned().unwrap_or_default();

    let ready_pid = match vars.get(PID_VAR) {
        Some(v) if !v.is_empty() => parse(PID_VAR, Some(v))?,
        _ => parent_pid,
    };
    let ready_signal = match vars.get(SIGNAL_VAR) {
        Some(v) => RestartSignal::from_raw(parse(SIGNAL_VAR, Some(v))?),
        None => RestartSignal::GracefulExit,
    };

    // Checked before touching the descriptor: if the variables were meant
    // for some other process, `fd` may be one of ours.
    if parent_pid != real_parent {
        return Err(HandoffError::StaleEnvironment {
            expected: parent_pid,
            actual: real_parent,
        });
    }

    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup == -1 {
        return Err(invalid(format!(
            "descriptor {}: {}",
            fd,
            io::Error::last_os_error()
        )));
    }

    // SAFETY: `dup` was just created by fcntl and nothing else refers to it.
    let socket = Socket::from(unsafe { OwnedFd::from_raw_fd(dup) });
    let listener = adopt(socket).map_err(|e| invalid(format!("descriptor {}: {}", fd, e)))?;

    // The listener lives on the duplicate now; release the inherited number.
    unsafe { libc::close(fd) };
    debug!(fd, dup, "closed inherited descriptor");

    info!(fd = dup, name = %name, parent_pid, "inherited listener");

    Ok(Inherited {
        listener,
        predecessor: Predecessor {
            name,
            parent_pid,
            ready_pid,
            ready_signal,
        },
    })
}

fn adopt(socket: Socket) -> io::Result<Listener> {
    if socket.r#type()? != Type::STREAM {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a stream socket",
        ));
    }

    if !is_listening(&socket)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not listening",
        ));
    }

    Listener::from_socket(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn is_listening(socket: &Socket) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(value != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn is_listening(_socket: &Socket) -> io::Result<bool> {
    Ok(true)
}

pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };

    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: Option<&String>) -> Result<T, HandoffError> {
    let value = value.ok_or_else(|| invalid(format!("{} is missing", key)))?;
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{} is {:?}", key, value)))
}

fn invalid(reason: String) -> HandoffError {
    HandoffError::EnvironmentInvalid(reason)
}
