//! Liveness probe for container health checks.

use crate::transport::{dial, Network};

use std::time::Duration;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Open a bare connection to the agent's own listen address. Returns the
/// process exit code: 0 when something accepts, 1 otherwise.
pub async fn health(network: Network, addr: &str) -> i32 {
    match tokio::time::timeout(HEALTH_TIMEOUT, dial(network, addr)).await {
        Ok(Ok(_conn)) => 0,
        Ok(Err(e)) => {
            tracing::error!("Health check failed: {}", e);
            1
        }
        Err(_) => {
            tracing::error!("Health check timed out after {:?}", HEALTH_TIMEOUT);
            1
        }
    }
}
