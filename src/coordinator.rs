//! The signal-driven state machine.
//!
//! Signals follow the nginx/unicorn conventions, with SIGQUIT as the
//! graceful exit:
//!
//! | signal  | effect                                          |
//! |---------|-------------------------------------------------|
//! | SIGHUP  | reload hook                                     |
//! | SIGUSR1 | reopen-logs hook                                |
//! | SIGUSR2 | start a successor                               |
//! | SIGQUIT | stop accepting, return for a graceful shutdown  |
//! | SIGTERM | same as SIGQUIT                                 |
//! | SIGTSTP | stop this process with SIGSTOP                  |
//! | other   | exit immediately with 128 + signal number       |

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::listener::Listener;
use crate::relaunch::{ChildProcess, Strategy};
use crate::signals::RestartSignal;
use crate::supervisor::ConnectionSupervisor;

pub type Hook = Box<dyn Fn(&Listener) -> anyhow::Result<()> + Send + Sync>;

/// Application callbacks. Failures are logged and otherwise ignored.
#[derive(Default)]
pub struct Hooks {
    reload: Option<Hook>,
    reopen_logs: Option<Hook>,
}

impl Hooks {
    pub fn on_reload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Listener) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.reload = Some(Box::new(hook));
        self
    }

    pub fn on_reopen_logs<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Listener) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.reopen_logs = Some(Box::new(hook));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listening,
    Exiting,
}

/// Why [`Coordinator::await_signals`] returned. In every case the
/// supervisor has already stopped accepting.
#[derive(Debug)]
pub enum Exit {
    GracefulExit,
    Stop,
    /// A successor was started and this process should drain and exit.
    Relaunched(ChildProcess),
    /// The successor is accepting; drain, then exec in place.
    Reexec(ChildProcess),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Signal source closed.")]
    SignalsClosed,
    #[error("Coordinator has already exited.")]
    AlreadyExited,
}

pub struct Coordinator {
    supervisor: ConnectionSupervisor,
    strategy: Arc<dyn Strategy>,
    signals: mpsc::Receiver<RestartSignal>,
    hooks: Hooks,
    state: State,
    pending: Option<ChildProcess>,
    exit_after_relaunch: bool,
    handshake_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        supervisor: ConnectionSupervisor,
        strategy: Arc<dyn Strategy>,
        signals: mpsc::Receiver<RestartSignal>,
    ) -> Self {
        Self {
            supervisor,
            strategy,
            signals,
            hooks: Hooks::default(),
            state: State::Listening,
            pending: None,
            exit_after_relaunch: false,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Close the listener and leave once a successor has been spawned,
    /// instead of waiting for it to ask.
    pub fn exit_after_relaunch(mut self, yes: bool) -> Self {
        self.exit_after_relaunch = yes;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pending_successor(&self) -> Option<u32> {
        self.pending.as_ref().map(|child| child.pid)
    }

    /// Block until a signal ends this process's role.
    pub async fn await_signals(&mut self) -> Result<Exit, CoordinatorError> {
        if self.state == State::Exiting {
            return Err(CoordinatorError::AlreadyExited);
        }

        loop {
            let sig = self
                .signals
                .recv()
                .await
                .ok_or(CoordinatorError::SignalsClosed)?;

            info!(%sig, pid = std::process::id(), "handling signal");

            if let Some(exit) = self.handle(sig) {
                self.state = State::Exiting;
                return Ok(exit);
            }
        }
    }

    fn handle(&mut self, sig: RestartSignal) -> Option<Exit> {
        match sig {
            RestartSignal::Reload => {
                self.run_hook("reload", self.hooks.reload.as_ref());
                None
            }
            RestartSignal::ReopenLogs => {
                self.run_hook("reopen-logs", self.hooks.reopen_logs.as_ref());
                None
            }
            RestartSignal::BeginRestart => self.begin_restart(),
            RestartSignal::GracefulExit => {
                self.stop_accepting();
                Some(Exit::GracefulExit)
            }
            RestartSignal::Stop => {
                self.stop_accepting();
                Some(Exit::Stop)
            }
            sig if sig.is_suspend() => {
                suspend();
                None
            }
            RestartSignal::Other(n) => exit_immediately(n),
        }
    }

    /// Run `drain` to completion while still answering signals. Once
    /// exiting, only suspension and the immediate-exit signals have an
    /// effect.
    pub async fn drain_with<F: Future>(&mut self, drain: F) -> F::Output {
        tokio::pin!(drain);
        let mut receiving = true;

        loop {
            tokio::select! {
                output = &mut drain => return output,
                sig = self.signals.recv(), if receiving => match sig {
                    Some(sig) => handle_while_exiting(sig),
                    None => receiving = false,
                },
            }
        }
    }

    fn run_hook(&self, name: &'static str, hook: Option<&Hook>) {
        if let (Some(hook), Some(listener)) = (hook, self.supervisor.listener()) {
            if let Err(e) = hook(listener.as_ref()) {
                error!(hook = name, error = %format!("{:#}", e), "hook failed");
            }
        }
    }

    fn begin_restart(&mut self) -> Option<Exit> {
        self.forget_stale_successor();

        if let Some(child) = self.pending.take() {
            if self.strategy.reexec_on_ready() {
                info!(pid = child.pid, "successor ready, handing over for exec");
                self.stop_accepting();
                return Some(Exit::Reexec(child));
            }

            warn!(pid = child.pid, "restart already in progress, ignoring");
            self.pending = Some(child);
            return None;
        }

        let Some(listener) = self.supervisor.listener() else {
            warn!("listener already released, ignoring restart");
            return None;
        };

        match self.strategy.spawn_successor(&listener) {
            Ok(child) if self.exit_after_relaunch => {
                info!(pid = child.pid, "successor spawned, leaving");
                self.stop_accepting();
                Some(Exit::Relaunched(child))
            }
            Ok(child) => {
                self.pending = Some(child);
                None
            }
            Err(e) => {
                error!(error = %e, "restart abandoned, still serving");
                None
            }
        }
    }

    fn forget_stale_successor(&mut self) {
        let stale = match self.pending.as_mut() {
            Some(child) if child.spawned_at.elapsed() >= self.handshake_timeout => {
                warn!(pid = child.pid, "successor never completed the handshake");
                true
            }
            Some(child) => child.has_exited(),
            None => false,
        };

        if stale {
            self.pending = None;
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(child) = &self.pending {
            info!(pid = child.pid, "handing off to successor");
        }

        self.supervisor.close();
    }
}

fn handle_while_exiting(sig: RestartSignal) {
    match sig {
        sig if sig.is_suspend() => suspend(),
        RestartSignal::Other(n) => exit_immediately(n),
        sig => info!(%sig, "already exiting, ignoring signal"),
    }
}

fn suspend() {
    info!("suspending");
    unsafe { libc::kill(libc::getpid(), libc::SIGSTOP) };
}

fn exit_immediately(signo: i32) -> ! {
    warn!(signal = signo, "exiting immediately");
    std::process::exit(128 + signo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relaunch::RelaunchError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeStrategy {
        spawned: AtomicUsize,
        fail: bool,
        reexec: bool,
    }

    impl Strategy for FakeStrategy {
        fn spawn_successor(&self, _: &Listener) -> Result<ChildProcess, RelaunchError> {
            if self.fail {
                return Err(RelaunchError::ExecutableNotFound {
                    path: PathBuf::from("/nowhere"),
                    reason: "test".to_string(),
                });
            }

            let n = self.spawned.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(ChildProcess::new(4242 + n))
        }

        fn reexec_on_ready(&self) -> bool {
            self.reexec
        }
    }

    struct Harness {
        tx: mpsc::Sender<RestartSignal>,
        supervisor: ConnectionSupervisor,
        strategy: Arc<FakeStrategy>,
    }

    fn coordinator(strategy: FakeStrategy) -> (Coordinator, Harness) {
        let listener = Listener::bind(&"tcp:127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let supervisor = ConnectionSupervisor::new(Arc::new(listener));
        let strategy = Arc::new(strategy);
        let (tx, rx) = mpsc::channel(16);

        let coordinator = Coordinator::new(supervisor.clone(), strategy.clone(), rx);
        (
            coordinator,
            Harness {
                tx,
                supervisor,
                strategy,
            },
        )
    }

    #[tokio::test]
    async fn graceful_exit_and_stop_end_the_wait() {
        for (sig, graceful) in [(RestartSignal::GracefulExit, true), (RestartSignal::Stop, false)] {
            let (mut coordinator, h) = coordinator(FakeStrategy::default());
            h.tx.send(sig).await.unwrap();

            let exit = coordinator.await_signals().await.unwrap();
            assert_eq!(matches!(exit, Exit::GracefulExit), graceful);
            assert_eq!(matches!(exit, Exit::Stop), !graceful);
            assert_eq!(coordinator.state(), State::Exiting);
            assert!(h.supervisor.is_closed());

            assert!(matches!(
                coordinator.await_signals().await,
                Err(CoordinatorError::AlreadyExited)
            ));
        }
    }

    #[tokio::test]
    async fn hooks_run_and_failures_are_not_fatal() {
        let (coordinator, h) = coordinator(FakeStrategy::default());
        let reloads = Arc::new(AtomicUsize::new(0));
        let reopens = Arc::new(AtomicUsize::new(0));

        let hooks = {
            let reloads = reloads.clone();
            let reopens = reopens.clone();
            Hooks::default()
                .on_reload(move |listener| {
                    assert_eq!(listener.protocol(), "tcp");
                    reloads.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("bad config")
                })
                .on_reopen_logs(move |_| {
                    reopens.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
        };
        let mut coordinator = coordinator.with_hooks(hooks);

        for sig in [
            RestartSignal::Reload,
            RestartSignal::ReopenLogs,
            RestartSignal::Reload,
            RestartSignal::GracefulExit,
        ] {
            h.tx.send(sig).await.unwrap();
        }

        assert!(matches!(
            coordinator.await_signals().await.unwrap(),
            Exit::GracefulExit
        ));
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
        assert_eq!(reopens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_hooks_are_skipped() {
        let (mut coordinator, h) = coordinator(FakeStrategy::default());
        h.tx.send(RestartSignal::Reload).await.unwrap();
        h.tx.send(RestartSignal::ReopenLogs).await.unwrap();
        h.tx.send(RestartSignal::Stop).await.unwrap();

        assert!(matches!(coordinator.await_signals().await.unwrap(), Exit::Stop));
    }

    #[tokio::test]
    async fn restart_keeps_listening_until_told_to_exit() {
        let (mut coordinator, h) = coordinator(FakeStrategy::default());
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        // Only one successor at a time.
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::Reload).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(100), coordinator.await_signals()).await;
        assert!(waiting.is_err(), "coordinator returned early");
        assert_eq!(coordinator.state(), State::Listening);
        assert!(!h.supervisor.is_closed());
        assert_eq!(h.strategy.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_successor(), Some(4242));

        h.tx.send(RestartSignal::GracefulExit).await.unwrap();
        assert!(matches!(
            coordinator.await_signals().await.unwrap(),
            Exit::GracefulExit
        ));
        assert!(h.supervisor.is_closed());
    }

    #[tokio::test]
    async fn stale_successor_is_forgotten() {
        let (coordinator, h) = coordinator(FakeStrategy::default());
        let mut coordinator = coordinator.handshake_timeout(Duration::ZERO);

        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::Stop).await.unwrap();

        coordinator.await_signals().await.unwrap();
        assert_eq!(h.strategy.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_spawn_is_not_fatal() {
        let (mut coordinator, h) = coordinator(FakeStrategy {
            fail: true,
            ..Default::default()
        });
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::Stop).await.unwrap();

        assert!(matches!(coordinator.await_signals().await.unwrap(), Exit::Stop));
        assert_eq!(coordinator.pending_successor(), None);
    }

    #[tokio::test]
    async fn drain_then_exit_variant_leaves_after_spawn() {
        let (coordinator, h) = coordinator(FakeStrategy::default());
        let mut coordinator = coordinator.exit_after_relaunch(true);
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();

        match coordinator.await_signals().await.unwrap() {
            Exit::Relaunched(child) => assert_eq!(child.pid, 4242),
            other => panic!("unexpected exit {:?}", other),
        }
        assert!(h.supervisor.is_closed());
    }

    #[tokio::test]
    async fn exec_strategy_reexecs_when_successor_reports() {
        let (mut coordinator, h) = coordinator(FakeStrategy {
            reexec: true,
            ..Default::default()
        });
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();

        match coordinator.await_signals().await.unwrap() {
            Exit::Reexec(child) => assert_eq!(child.pid, 4242),
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(h.strategy.spawned.load(Ordering::SeqCst), 1);
        assert!(h.supervisor.is_closed());
    }

    #[tokio::test]
    async fn signals_are_consumed_while_draining() {
        let reloads = Arc::new(AtomicUsize::new(0));
        let (coordinator, h) = coordinator(FakeStrategy::default());
        let hooks = {
            let reloads = reloads.clone();
            Hooks::default().on_reload(move |_| {
                reloads.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let mut coordinator = coordinator.with_hooks(hooks);

        h.tx.send(RestartSignal::GracefulExit).await.unwrap();
        coordinator.await_signals().await.unwrap();

        for sig in [RestartSignal::Reload, RestartSignal::Stop, RestartSignal::BeginRestart] {
            h.tx.send(sig).await.unwrap();
        }

        let tx = h.tx.clone();
        let drained = coordinator
            .drain_with(async move {
                while tx.capacity() < 16 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                7
            })
            .await;

        assert_eq!(drained, 7);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
        assert_eq!(h.strategy.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_signal_source_does_not_cut_drain_short() {
        let (mut coordinator, h) = coordinator(FakeStrategy::default());
        drop(h.tx);

        let drained = coordinator
            .drain_with(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "drained"
            })
            .await;
        assert_eq!(drained, "drained");
    }

    #[tokio::test]
    async fn released_listener_skips_restart_and_hooks() {
        let (coordinator, h) = coordinator(FakeStrategy::default());
        let mut coordinator = coordinator.with_hooks(Hooks::default().on_reload(|_| {
            panic!("hook ran without a listener")
        }));
        drop(h.supervisor.release_listener());

        h.tx.send(RestartSignal::Reload).await.unwrap();
        h.tx.send(RestartSignal::BeginRestart).await.unwrap();
        h.tx.send(RestartSignal::Stop).await.unwrap();

        assert!(matches!(coordinator.await_signals().await.unwrap(), Exit::Stop));
        assert_eq!(h.strategy.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_signal_source_is_an_error() {
        let (mut coordinator, h) = coordinator(FakeStrategy::default());
        drop(h.tx);

        assert!(matches!(
            coordinator.await_signals().await,
            Err(CoordinatorError::SignalsClosed)
        ));
    }
}
