//! Simple client example - asks service "example" for its name

use local_comm::ServiceCaller;
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

    let caller = ServiceCaller::new("example");

    let text_in = "hello, whats your name?";
    println!("[client] sending '{}' ...", text_in);
    let data_out = caller.call(text_in.as_bytes(), None).await?;

    println!("[client] received '{}'", String::from_utf8_lossy(&data_out));
    Ok(())
}
