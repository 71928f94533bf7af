use crate::error::OrchestratorError;
use std::time::Duration;
use tokio::{net::TcpStream, time::Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// True when a TCP connection to `host:port` can be established within one second.
pub async fn port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Polls `host:port` every `interval` until it accepts connections.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if port_open(host, port).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(OrchestratorError::readiness_timeout(
                format!("port {host}:{port}"),
                timeout,
            ));
        }
        tokio::time::sleep(interval).await;
    }
}
