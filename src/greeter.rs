use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::Service;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use handoff::supervisor::TrackedConnection;

/// Says which process answered, then echoes until the client hangs up.
#[derive(Clone)]
pub struct Greeter {
    pid: u32,
}

impl Greeter {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }
}

impl Service<TrackedConnection> for Greeter {
    type Response = ();
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut conn: TrackedConnection) -> Self::Future {
        let pid = self.pid;

        let fut = async move {
            conn.write_all(format!("hello from {}\n", pid).as_bytes()).await?;

            let mut buf = [0u8; 4096];
            loop {
                let n = conn.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                conn.write_all(&buf[..n]).await?;
            }

            conn.close().await?;

            Ok(())
        };

        Box::pin(fut)
    }
}
