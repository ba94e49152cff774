//! u32 little-endian length-prefixed framing.
//!
//! The length prefix is checked against [`MAX_MESSAGE_BYTES`] before any allocation.

use serde::de::DeserializeOwned;

use crate::{decode, ProtoError, MAX_MESSAGE_BYTES};

fn check_len(len: usize) -> Result<(), ProtoError> {
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtoError::TooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(())
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    check_len(payload.len())?;
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode exactly one length-prefixed message from `bytes`.
pub fn decode_framed_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    let Some(prefix) = bytes.get(..4) else {
        return Err(ProtoError::Truncated {
            expected: 4,
            actual: bytes.len(),
        });
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    check_len(len)?;
    let body = &bytes[4..];
    if body.len() < len {
        return Err(ProtoError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    if body.len() > len {
        return Err(ProtoError::TrailingBytes(body.len() - len));
    }
    decode(body)
}

#[cfg(feature = "tokio")]
mod io {
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use super::check_len;
    use crate::ProtoError;

    /// Write one frame and flush.
    pub async fn write_frame(
        stream: &mut (impl AsyncWrite + Unpin),
        payload: &[u8],
    ) -> Result<(), ProtoError> {
        check_len(payload.len())?;
        stream.write_u32_le(payload.len() as u32).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one frame.
    ///
    /// A clean EOF before the length prefix is reported as [`ProtoError::ConnectionClosed`].
    pub async fn read_frame(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>, ProtoError> {
        let len = match stream.read_u32_le().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtoError::ConnectionClosed)
            }
            Err(err) => return Err(err.into()),
        };
        check_len(len)?;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(feature = "tokio")]
pub use io::{read_frame, write_frame};
