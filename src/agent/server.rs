//! Agent listener: challenge, verify, serve one snapshot.

use crate::collector::Collector;
use crate::transport::{
    fingerprint, read_frame, verify_challenge, write_frame, Conn, Frame, Listener, TransportError,
};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Time a peer gets to send each hub frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves snapshots to authenticated hubs.
pub struct AgentServer {
    keys: Arc<Vec<VerifyingKey>>,
    collector: Arc<Collector>,
    fingerprint: String,
}

impl AgentServer {
    pub fn new(keys: Vec<VerifyingKey>, collector: Arc<Collector>, fingerprint: String) -> Self {
        Self {
            keys: Arc::new(keys),
            collector,
            fingerprint,
        }
    }

    /// Accept connections until `stop` fires. Each connection is handled on
    /// its own task.
    pub async fn serve(self: Arc<Self>, listener: Listener, mut stop: broadcast::Receiver<()>) {
        tracing::info!("Agent listening on {}", listener.local_addr());

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("Agent listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(conn, &peer).await {
                            tracing::debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle(&self, mut conn: Box<dyn Conn>, peer: &str) -> Result<(), TransportError> {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        write_frame(
            &mut conn,
            &Frame::Hello {
                version: env!("CARGO_PKG_VERSION").to_string(),
                nonce: STANDARD.encode(nonce),
                fingerprint: self.fingerprint.clone(),
            },
        )
        .await?;

        let (public_key, signature) = match read_with_timeout(&mut conn).await? {
            Frame::Auth {
                public_key,
                signature,
            } => (public_key, signature),
            other => {
                tracing::warn!("Closing {}: expected auth, got {}", peer, other.kind());
                return Ok(());
            }
        };

        // Nothing else is written on a failed check; the peer just sees EOF.
        let key = match verify_challenge(&self.keys, &public_key, &signature, &nonce) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("Rejected connection from {}: {}", peer, e);
                return Ok(());
            }
        };
        let requester = fingerprint(&key);
        tracing::debug!("Authenticated {} as {}", peer, requester);

        match read_with_timeout(&mut conn).await? {
            Frame::GetStats => {}
            other => {
                let message = format!("unexpected {} request", other.kind());
                return write_frame(&mut conn, &Frame::Error { message }).await;
            }
        }

        let collector = self.collector.clone();
        let snapshot = tokio::task::spawn_blocking(move || collector.gather(&requester))
            .await
            .map_err(|e| TransportError::Protocol(format!("collection failed: {}", e)))?;

        write_frame(
            &mut conn,
            &Frame::Stats {
                data: snapshot.as_ref().clone(),
            },
        )
        .await
    }
}

async fn read_with_timeout(conn: &mut Box<dyn Conn>) -> Result<Frame, TransportError> {
    tokio::time::timeout(FRAME_TIMEOUT, read_frame(conn))
        .await
        .map_err(|_| TransportError::Timeout(FRAME_TIMEOUT))?
}
