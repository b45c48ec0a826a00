//! Hub side of the exchange.

use super::{dial, format_public_key, read_frame, sign_challenge, write_frame, Frame, Network, TransportError};
use crate::stats::Snapshot;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::Duration;

/// A snapshot fetched from an agent, with the fingerprint the agent reported.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub snapshot: Snapshot,
    pub fingerprint: String,
}

/// Fetches snapshots from agents using the hub's identity key.
#[derive(Clone)]
pub struct AgentClient {
    key: Arc<SigningKey>,
    public_key: String,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(key: Arc<SigningKey>, timeout: Duration) -> Self {
        let public_key = format_public_key(&key.verifying_key());
        Self {
            key,
            public_key,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one complete exchange under the client deadline.
    ///
    /// An empty `expected_fingerprint` accepts whatever the agent reports.
    pub async fn fetch(
        &self,
        network: Network,
        addr: &str,
        expected_fingerprint: &str,
    ) -> Result<FetchedSnapshot, TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(network, addr, expected_fingerprint))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        network: Network,
        addr: &str,
        expected_fingerprint: &str,
    ) -> Result<FetchedSnapshot, TransportError> {
        let mut stream = dial(network, addr).await?;

        let (nonce, fingerprint) = match read_frame(&mut stream).await? {
            Frame::Hello {
                nonce, fingerprint, ..
            } => (nonce, fingerprint),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
        };

        if !expected_fingerprint.is_empty() && expected_fingerprint != fingerprint {
            return Err(TransportError::FingerprintMismatch {
                expected: expected_fingerprint.to_string(),
                actual: fingerprint,
            });
        }

        let nonce = STANDARD
            .decode(nonce)
            .map_err(|e| TransportError::Protocol(format!("bad nonce: {}", e)))?;

        let auth = Frame::Auth {
            public_key: self.public_key.clone(),
            signature: sign_challenge(&self.key, &nonce),
        };

        // From here on a closed connection means the agent refused us.
        let reply = async {
            write_frame(&mut stream, &auth).await?;
            write_frame(&mut stream, &Frame::GetStats).await?;
            read_frame(&mut stream).await
        }
        .await
        .map_err(|e| if e.is_closed() { TransportError::Rejected } else { e })?;

        match reply {
            Frame::Stats { data } => Ok(FetchedSnapshot {
                snapshot: data,
                fingerprint,
            }),
            Frame::Error { message } => Err(TransportError::Protocol(message)),
            other => Err(TransportError::Protocol(format!(
                "expected stats, got {}",
                other.kind()
            ))),
        }
    }
}
