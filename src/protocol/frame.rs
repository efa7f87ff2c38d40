//! Length-prefixed framing for the worker channel.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON body. The
//! framing layer is agnostic to what the body is: control connections carry
//! [`Envelope`](super::Envelope)s, and the very first frame of any inbound
//! connection is a [`Hello`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FleetError, Result};

/// Maximum frame size. Deploy commands are the largest payloads and stay
/// well under this; anything bigger indicates a corrupted stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FleetError::FrameTooLarge(body.len(), MAX_FRAME_SIZE));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// A clean EOF at a frame boundary maps to `ConnectionClosed`; an oversized
/// length prefix is treated as stream corruption and the caller should drop
/// the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FleetError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FleetError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FleetError::ConnectionClosed
        } else {
            FleetError::Io(e)
        }
    })?;
    Ok(body)
}

/// First frame on every inbound connection to the gateway.
///
/// Control connections carry envelopes afterwards; tunnel connections become
/// raw byte streams claimed by the session broker. A hello with the wrong
/// secret gets the connection closed before anything else is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Hello {
    Control { secret: String },
    Tunnel { secret: String, session_id: String },
}

impl Hello {
    pub fn secret(&self) -> &str {
        match self {
            Hello::Control { secret } => secret,
            Hello::Tunnel { secret, .. } => secret,
        }
    }
}
