//! Read ten holding registers from a Modbus TCP device.
//!
//! Usage: `cargo run --example read_holding -- 192.168.1.50:502`

use ferrobus_client::{Client, ClientConfig, ObjectKind, Range, TcpConnector};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:502".to_string());

    let config = ClientConfig::default()
        .with_response_timeout(Some(Duration::from_secs(1)))
        .with_retry_count(2);
    let client = Client::with_config(TcpConnector::new(addr), config);

    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[Range::new(0, 9)?])
        .await?;
    for (address, value) in objects.iter() {
        println!("{address}: {value}");
    }
    Ok(())
}
