//! Broker wire frames and framing
//!
//! u32 length prefix + bincode body, small cap on frame size. The same
//! frame enum travels in both directions; which variants are legal from
//! which side is enforced by the server and client state machines.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on one frame. Vote sets are tiny; anything bigger is a bug.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerFrame {
    /// Client → broker: claim an endpoint name. Must be the first frame.
    Register { endpoint: String },
    /// Broker → client: registration verdict. `ok: false` means the name
    /// is taken and the connection will be dropped.
    RegisterAck { ok: bool },
    /// Client → broker: ask to link with a registered name.
    Dial { target: String },
    /// Broker → dialed client: someone wants a link.
    DialRequest { from: String },
    /// Client → broker: answer a pending `DialRequest`.
    DialAnswer { from: String, accept: bool },
    /// Broker → dialing client: the verdict on its `Dial`.
    DialResult { target: String, ok: bool },
    /// Client → broker: relay a payload to a linked endpoint.
    Send { to: String, payload: Vec<u8> },
    /// Broker → client: relayed payload.
    Deliver { from: String, payload: Vec<u8> },
    /// Either direction: one side of a link went away.
    CloseLink { peer: String },
}

impl BrokerFrame {
    pub fn tag(&self) -> &'static str {
        match self {
            BrokerFrame::Register { .. } => "Register",
            BrokerFrame::RegisterAck { .. } => "RegisterAck",
            BrokerFrame::Dial { .. } => "Dial",
            BrokerFrame::DialRequest { .. } => "DialRequest",
            BrokerFrame::DialAnswer { .. } => "DialAnswer",
            BrokerFrame::DialResult { .. } => "DialResult",
            BrokerFrame::Send { .. } => "Send",
            BrokerFrame::Deliver { .. } => "Deliver",
            BrokerFrame::CloseLink { .. } => "CloseLink",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &BrokerFrame,
) -> Result<(), FrameError> {
    let payload = bincode::serialize(frame).map_err(|e| FrameError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BrokerFrame, FrameError> {
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| FrameError::Codec(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
