//! Wire framing.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────────────┬──────────────────────────────┐
//! │ Length (4 bytes)│ JSON body (variable)         │
//! │ big-endian      │                              │
//! └─────────────────┴──────────────────────────────┘
//! ```
//!
//! One exchange is: `Hello` (agent), `Auth` (hub), `GetStats` (hub),
//! `Stats` (agent). The agent closes the connection instead of replying
//! when authentication fails.

use super::TransportError;
use crate::stats::Snapshot;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// All message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Agent greeting carrying the challenge nonce (base64).
    Hello {
        version: String,
        nonce: String,
        fingerprint: String,
    },
    /// Hub public key and its signature over the challenge.
    Auth {
        public_key: String,
        signature: String,
    },
    GetStats,
    Stats {
        data: Snapshot,
    },
    Error {
        message: String,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Auth { .. } => "auth",
            Frame::GetStats => "get_stats",
            Frame::Stats { .. } => "stats",
            Frame::Error { .. } => "error",
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::GetStats).await.unwrap();
        write_frame(
            &mut a,
            &Frame::Error {
                message: "nope".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(read_frame(&mut b).await.unwrap(), Frame::GetStats));
        match read_frame(&mut b).await.unwrap() {
            Frame::Error { message } => assert_eq!(message, "nope"),
            other => panic!("unexpected frame {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_closed());
    }
}
