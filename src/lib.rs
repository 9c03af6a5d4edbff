//! Zero-downtime restarts for a listening server.
//!
//! A running process hands its listening socket to a freshly started copy of
//! itself through the environment (`GOAGAIN_FD`, `GOAGAIN_NAME`,
//! `GOAGAIN_PPID`), the copy starts accepting, and only then does the old
//! process stop accepting and drain its in-flight connections.
//!
//! [`server::Server`] wires everything together around a `tower` service:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use handoff::config::Config;
//! use handoff::server::Server;
//! use handoff::supervisor::TrackedConnection;
//!
//! let svc = tower::service_fn(|mut conn: TrackedConnection| async move {
//!     conn.close().await?;
//!     Ok::<_, anyhow::Error>(())
//! });
//!
//! Server::from_config(Config::default()).serve(svc).await
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod handoff;
pub mod handshake;
pub mod listener;
pub mod relaunch;
pub mod server;
pub mod signals;
pub mod supervisor;
