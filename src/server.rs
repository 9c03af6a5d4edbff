use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::coordinator::{Coordinator, Exit, Hooks};
use crate::handoff::{self, HandoffError, Inherited, Predecessor};
use crate::handshake::{announce_ready, relinquish};
use crate::listener::Listener;
use crate::relaunch::replace_image;
use crate::signals;
use crate::supervisor::{AcceptError, ConnectionSupervisor, TrackedConnection};

/// Pause after an accept error that is not ours to fix, e.g. EMFILE.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server {
    config: Config,
    hooks: Hooks,
}

impl Server {
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            hooks: Hooks::default(),
        }
    }

    /// Run `hook` on SIGHUP.
    pub fn on_reload<F>(self, hook: F) -> Self
    where
        F: Fn(&Listener) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            hooks: self.hooks.on_reload(hook),
            ..self
        }
    }

    /// Run `hook` on SIGUSR1.
    pub fn on_reopen_logs<F>(self, hook: F) -> Self
    where
        F: Fn(&Listener) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            hooks: self.hooks.on_reopen_logs(hook),
            ..self
        }
    }

    /// Serve until a signal says this process is done, then drain.
    ///
    /// Under the exec strategy this only returns on failure; success
    /// replaces the process image.
    pub async fn serve<S>(self, svc: S) -> Result<()>
    where
        S: Service<TrackedConnection, Response = (), Error = anyhow::Error>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
    {
        // Before anything that could make a predecessor signal us.
        let signals = signals::install()?;
        let strategy = self.config.strategy.build();

        let (listener, predecessor) = resolve_listener(&self.config)?;
        info!(
            addr = %listener.local_addr()?,
            pid = std::process::id(),
            inherited = predecessor.is_some(),
            "listening"
        );

        let supervisor = ConnectionSupervisor::new(Arc::new(listener));
        let (accepting_tx, accepting_rx) = oneshot::channel();
        let accepts = tokio::spawn(accept_loop(supervisor.clone(), svc, accepting_tx));

        if let Some(predecessor) = predecessor {
            announce_ready(strategy.as_ref(), &predecessor, accepting_rx).await?;
        }

        let mut coordinator = Coordinator::new(supervisor.clone(), strategy, signals)
            .with_hooks(self.hooks)
            .exit_after_relaunch(self.config.exit_after_relaunch)
            .handshake_timeout(self.config.handshake_timeout());

        let exit = coordinator.await_signals().await?;

        if let Err(e) = accepts.await {
            warn!(error = %e, "accept loop panicked");
        }

        // Only an image about to exec still needs the descriptor. Any
        // successor holds its own reference to the socket.
        let listener = supervisor.release_listener();
        let listener = match exit {
            Exit::Reexec(_) => listener,
            _ => {
                drop(listener);
                info!("stopped listening");
                None
            }
        };

        coordinator
            .drain_with(relinquish(&supervisor, self.config.drain_timeout()))
            .await?;

        match exit {
            Exit::Reexec(successor) => {
                let listener = listener.ok_or_else(|| anyhow!("listener released before exec"))?;
                Err(replace_image(&listener, successor.pid).into())
            }
            Exit::Relaunched(successor) => {
                info!(successor = successor.pid, "exiting after relaunch");
                Ok(())
            }
            Exit::GracefulExit | Exit::Stop => {
                info!("exiting");
                Ok(())
            }
        }
    }
}

/// Inherit the predecessor's listener if there is one, otherwise bind.
fn resolve_listener(config: &Config) -> Result<(Listener, Option<Predecessor>)> {
    match handoff::decode() {
        Ok(Inherited {
            listener,
            predecessor,
        }) => {
            info!(
                name = %predecessor.name,
                parent = predecessor.parent_pid,
                "inherited listener"
            );
            Ok((listener, Some(predecessor)))
        }
        Err(HandoffError::EnvironmentMissing) => {
            Ok((Listener::bind(&config.listen, config.backlog)?, None))
        }
        Err(e @ HandoffError::EnvironmentInvalid(_)) => {
            warn!(error = %e, addr = %config.listen, "ignoring inherited listener, binding afresh");
            Ok((Listener::bind(&config.listen, config.backlog)?, None))
        }
        Err(e @ HandoffError::StaleEnvironment { .. }) => Err(e.into()),
    }
}

async fn accept_loop<S>(supervisor: ConnectionSupervisor, svc: S, accepting: oneshot::Sender<()>)
where
    S: Service<TrackedConnection, Response = (), Error = anyhow::Error> + Clone + Send + 'static,
    S::Future: Send,
{
    // The first accept is about to be polled; connections queued since the
    // listen are already waiting for us.
    let _ = accepting.send(());

    loop {
        let conn = match supervisor.accept().await {
            Ok(conn) => conn,
            Err(AcceptError::Closed) => break,
            Err(AcceptError::Io(e)) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let peer = conn.peer_addr().clone();
        let mut svc = svc.clone();

        tokio::spawn(async move {
            debug!(%peer, "connection accepted");

            let result = match svc.ready().await {
                Ok(svc) => svc.call(conn).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(%peer, error = %format!("{:#}", e), "connection failed");
            }
        });
    }

    debug!("accept loop stopped");
}
