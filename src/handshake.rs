//! Who keeps serving and who leaves.
//!
//! The successor starts accepting on the inherited descriptor before it
//! says anything, so the address is never without an acceptor. Only then
//! does it notify the predecessor, which stops accepting and drains.

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use std::io;
use std::time::Duration;

use crate::handoff::Predecessor;
use crate::relaunch::Strategy;
use crate::supervisor::{ConnectionSupervisor, DrainTimeout};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Accept loop stopped before it was running.")]
    AcceptLoopStopped,
    #[error("Unable to notify predecessor {pid}: {source}")]
    Notify { pid: u32, source: io::Error },
}

/// Successor side: once `accepting` fires, tell the predecessor.
///
/// A predecessor that is already gone is not an error; we are serving
/// either way.
pub async fn announce_ready(
    strategy: &dyn Strategy,
    predecessor: &Predecessor,
    accepting: oneshot::Receiver<()>,
) -> Result<(), HandshakeError> {
    accepting
        .await
        .map_err(|_| HandshakeError::AcceptLoopStopped)?;

    match strategy.confirm_ready(predecessor) {
        Ok(()) => {
            info!(
                pid = predecessor.ready_pid,
                signal = %predecessor.ready_signal,
                "notified predecessor"
            );
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            warn!(pid = predecessor.ready_pid, "predecessor already exited");
            Ok(())
        }
        Err(source) => Err(HandshakeError::Notify {
            pid: predecessor.ready_pid,
            source,
        }),
    }
}

/// Predecessor side: stop accepting and wait for in-flight connections.
pub async fn relinquish(
    supervisor: &ConnectionSupervisor,
    timeout: Duration,
) -> Result<(), DrainTimeout> {
    supervisor.close();

    info!(
        active = supervisor.active_connections(),
        timeout_secs = timeout.as_secs(),
        "draining connections"
    );

    match supervisor.drain(timeout).await {
        Ok(()) => {
            info!("all connections drained");
            Ok(())
        }
        Err(e) => {
            error!(remaining = e.remaining, "{}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenAddr, Listener};
    use crate::relaunch::{ChildProcess, InheritStrategy, RelaunchError};
    use crate::signals::RestartSignal;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpStream;

    #[derive(Debug, Default)]
    struct Recording {
        notified: Mutex<Vec<u32>>,
    }

    impl Strategy for Recording {
        fn spawn_successor(&self, _: &Listener) -> Result<ChildProcess, RelaunchError> {
            unreachable!("successor side only")
        }

        fn signal_predecessor_exit(&self, pid: u32) -> io::Result<()> {
            self.notified.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn predecessor(pid: u32) -> Predecessor {
        Predecessor {
            name: "tcp:127.0.0.1:1->".to_string(),
            parent_pid: pid,
            ready_pid: pid,
            ready_signal: RestartSignal::GracefulExit,
        }
    }

    #[tokio::test]
    async fn notifies_only_after_accept_loop_runs() {
        let strategy = Recording::default();
        let (tx, rx) = oneshot::channel();
        let pred = predecessor(31);

        let announce = announce_ready(&strategy, &pred, rx);
        tokio::pin!(announce);

        tokio::select! {
            _ = &mut announce => panic!("announced before accepting"),
            _ = tokio::task::yield_now() => {}
        }
        assert!(strategy.notified.lock().unwrap().is_empty());

        tx.send(()).unwrap();
        announce.await.unwrap();
        assert_eq!(*strategy.notified.lock().unwrap(), vec![31]);
    }

    #[tokio::test]
    async fn stopped_accept_loop_is_reported() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);

        let err = announce_ready(&Recording::default(), &predecessor(1), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::AcceptLoopStopped));
    }

    #[tokio::test]
    async fn vanished_predecessor_is_tolerated() {
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();

        announce_ready(&InheritStrategy, &predecessor(i32::MAX as u32), rx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn relinquish_stops_accepting_and_waits_for_clients() {
        let listener = Listener::bind(&"tcp:127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let ListenAddr::Tcp(addr) = listener.local_addr().unwrap() else {
            panic!("expected tcp");
        };
        let supervisor = ConnectionSupervisor::new(Arc::new(listener));

        let _client = TcpStream::connect(addr).await.unwrap();
        let conn = supervisor.accept().await.unwrap();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(conn);
        });

        relinquish(&supervisor, Duration::from_secs(10)).await.unwrap();
        assert!(supervisor.is_closed());
        assert!(supervisor.accept().await.unwrap_err().is_closing());
        closer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn relinquish_gives_up_after_timeout() {
        let listener = Listener::bind(&"tcp:127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let supervisor = ConnectionSupervisor::new(Arc::new(listener));
        let _guards: Vec<_> = (0..3).map(|_| supervisor.counter().acquire()).collect();

        let err = relinquish(&supervisor, Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err.remaining, 3);
    }
}
