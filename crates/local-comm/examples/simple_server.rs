//! Simple server example - answers every request on service "example" with "chris"
//!
//! Run alongside `simple_client`. Stop with Ctrl+C.

use local_comm::Endpoint;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let mut endpoint = Endpoint::new();
    endpoint.register("example", |input: &[u8]| {
        info!("received request '{}'", String::from_utf8_lossy(input));
        Ok::<_, String>(b"chris".to_vec())
    })?;

    println!("[server] ready on service 'example' (Ctrl+C to stop)");
    endpoint.run().await?;
    Ok(())
}
