//! framecast-server: framed TCP server with routed handlers, jittered
//! heartbeats, and gated chunked file serving.

use framecast::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        file_root = %config.file_root.display(),
        transfers_allowed = config.allow_on_start,
        "Starting framecast server"
    );

    let server = Server::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, closing connections");
            server.shutdown_all();
        }
    }
    Ok(())
}
