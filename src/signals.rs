use futures::stream::{self, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use std::fmt;
use std::io;

/// Every raw signal the funnel subscribes to.
const SUBSCRIBED: [libc::c_int; 7] = [
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGTSTP,
];

/// A signal as the rest of the crate sees it. Raw numbers only exist at the
/// edges: [`RestartSignal::from_raw`] on the way in, [`RestartSignal::as_raw`]
/// when one process signals another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartSignal {
    /// SIGHUP
    Reload,
    /// SIGUSR1
    ReopenLogs,
    /// SIGUSR2
    BeginRestart,
    /// SIGQUIT
    GracefulExit,
    /// SIGTERM
    Stop,
    Other(i32),
}

impl RestartSignal {
    pub fn from_raw(signo: i32) -> Self {
        match signo {
            libc::SIGHUP => Self::Reload,
            libc::SIGUSR1 => Self::ReopenLogs,
            libc::SIGUSR2 => Self::BeginRestart,
            libc::SIGQUIT => Self::GracefulExit,
            libc::SIGTERM => Self::Stop,
            n => Self::Other(n),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Reload => libc::SIGHUP,
            Self::ReopenLogs => libc::SIGUSR1,
            Self::BeginRestart => libc::SIGUSR2,
            Self::GracefulExit => libc::SIGQUIT,
            Self::Stop => libc::SIGTERM,
            Self::Other(n) => n,
        }
    }

    /// Interactive suspend (Ctrl+Z).
    pub fn is_suspend(self) -> bool {
        self == Self::Other(libc::SIGTSTP)
    }
}

impl fmt::Display for RestartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reload => f.write_str("SIGHUP"),
            Self::ReopenLogs => f.write_str("SIGUSR1"),
            Self::BeginRestart => f.write_str("SIGUSR2"),
            Self::GracefulExit => f.write_str("SIGQUIT"),
            Self::Stop => f.write_str("SIGTERM"),
            Self::Other(libc::SIGINT) => f.write_str("SIGINT"),
            Self::Other(libc::SIGTSTP) => f.write_str("SIGTSTP"),
            Self::Other(n) => write!(f, "signal {}", n),
        }
    }
}

/// Subscribe to every handled signal and funnel them into one receiver.
///
/// Registration happens before this returns, so a signal sent right after
/// the call is queued instead of hitting the default disposition. A single
/// spawned task owns the OS streams; dropping the receiver stops it.
pub fn install() -> io::Result<mpsc::Receiver<RestartSignal>> {
    let mut streams = Vec::with_capacity(SUBSCRIBED.len());

    for signo in SUBSCRIBED {
        let sig = signal(SignalKind::from_raw(signo))?;

        let stream = stream::unfold(sig, move |mut sig| async move {
            sig.recv().await.map(|()| (signo, sig))
        });

        streams.push(Box::pin(stream));
    }

    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut merged = stream::select_all(streams);

        while let Some(signo) = merged.next().await {
            let sig = RestartSignal::from_raw(signo);
            debug!(%sig, "signal received");

            if tx.send(sig).await.is_err() {
                break;
            }
        }

        warn!("signal funnel stopped");
    });

    Ok(rx)
}

/// Deliver `sig` to `pid`.
pub fn send(pid: u32, sig: RestartSignal) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    if unsafe { libc::kill(pid, sig.as_raw()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
