//! Connectivity probing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answers "can we reach the network right now?".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online when a TCP connect to `addr` succeeds within `timeout`.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Connectivity probe failed");
                false
            }
            Err(_) => {
                debug!(addr = %self.addr, "Connectivity probe timed out");
                false
            }
        }
    }
}

/// Fixed answer, for tests and offline setups.
pub struct StaticProbe(pub bool);

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        self.0
    }
}

/// Poll `probe` every `poll` until it reports online, `max_wait` elapses, or
/// `cancel` fires. Returns whether the network came up.
pub async fn wait_for_network(
    probe: &dyn ConnectivityProbe,
    max_wait: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> bool {
    if probe.is_online().await {
        return true;
    }

    info!(max_wait_secs = max_wait.as_secs(), "Network unavailable, waiting");
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(poll) => {}
        }
        if probe.is_online().await {
            info!("Network available");
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
    }
}
