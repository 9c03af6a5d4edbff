use anyhow::Result;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod greeter;

use handoff::config::get_config;
use handoff::server::Server;

use crate::greeter::Greeter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = get_config()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let svc = ServiceBuilder::new()
        .concurrency_limit(1024)
        .service(Greeter::new());

    Server::from_config(config)
        .on_reload(|listener| {
            let config = get_config()?;
            info!(
                listening = %listener.local_addr()?,
                configured = %config.listen,
                "configuration reloaded"
            );
            Ok(())
        })
        .on_reopen_logs(|_| {
            // Logs go to stderr; nothing to reopen.
            info!("reopen-logs requested");
            Ok(())
        })
        .serve(svc)
        .await
}
