//! framecast-client: opens a bundle of connections, answers heartbeats,
//! and drives downloads on every connection with exponentially distributed
//! waits between requests.

use framecast::{Client, Config};
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
        server = %config.connect,
        connections = config.connections,
        mean_wait_secs = config.mean_wait_secs,
        "Starting framecast client"
    );

    let mut client = Client::connect(&config).await?;
    let all = client.connections();
    client.start_requesting(all).await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, closing connections");
    client.stop_requesting().await;
    client.shutdown_all();
    client.join().await;
    Ok(())
}
