//! Length-delimited multi-part message framing
//!
//! A message is a big-endian `u32` part count followed by each part as a
//! big-endian `u32` length and the raw bytes. The same framing carries
//! router traffic and the peer mute broadcast.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Maximum number of parts in one message
pub const MAX_PARTS: u32 = 16;

/// Maximum size of a single part (16 MiB)
pub const MAX_PART_LEN: u32 = 16 * 1024 * 1024;

/// A decoded multi-part message
pub type Multipart = Vec<Vec<u8>>;

/// Encode parts into a single framed buffer
///
/// # Errors
///
/// Returns error if the message exceeds the framing limits
pub fn encode_multipart(parts: &[&[u8]]) -> Result<Vec<u8>> {
    let count = u32::try_from(parts.len())
        .ok()
        .filter(|n| (1..=MAX_PARTS).contains(n))
        .ok_or_else(|| Error::Protocol(format!("invalid part count {}", parts.len())))?;

    let body: usize = parts.iter().map(|p| p.len() + 4).sum();
    let mut buf = Vec::with_capacity(4 + body);
    buf.extend_from_slice(&count.to_be_bytes());

    for part in parts {
        let len = u32::try_from(part.len())
            .ok()
            .filter(|n| *n <= MAX_PART_LEN)
            .ok_or_else(|| Error::Protocol(format!("part too large: {} bytes", part.len())))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(part);
    }

    Ok(buf)
}

/// Write one framed message and flush
///
/// # Errors
///
/// Returns error if encoding or the underlying write fails
pub async fn write_multipart<W>(writer: &mut W, parts: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_multipart(parts)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
///
/// Returns `Ok(None)` when the stream ends cleanly on a message boundary.
///
/// # Errors
///
/// Returns error on a truncated frame or a frame exceeding the limits
pub async fn read_multipart<R>(reader: &mut R) -> Result<Option<Multipart>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if count == 0 || count > MAX_PARTS {
        return Err(Error::Protocol(format!("invalid part count {count}")));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await.map_err(truncated)?;
        if len > MAX_PART_LEN {
            return Err(Error::Protocol(format!("part too large: {len} bytes")));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await.map_err(truncated)?;
        parts.push(part);
    }

    Ok(Some(parts))
}

fn truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Protocol("connection closed mid-message".to_string())
    } else {
        e.into()
    }
}
