//! Network infrastructure implementing `NetworkProbe` with tokio sockets.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::application::ports::NetworkProbe;

/// Production implementation that performs real TCP connects.
pub struct TokioNetworkProbe;

impl NetworkProbe for TokioNetworkProbe {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out after {}s", timeout.as_secs()))?
            .with_context(|| format!("connect to {addr}"))?;
        drop(stream);
        Ok(())
    }
}
