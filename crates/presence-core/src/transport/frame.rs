//! Multi-part message framing.
//!
//! One message is a part count followed by length-prefixed parts:
//!
//! ```text
//! [u32 BE: parts][u32 BE: len][len bytes] ... repeated `parts` times
//! ```

use super::Multipart;
use crate::config::ProtocolConfig;
use crate::{Result, RpcError};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one multi-part message from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection between messages).
pub async fn read_multipart<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Multipart>> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let count = u32::from_be_bytes(count_buf) as usize;
    if count > ProtocolConfig::MAX_FRAME_PARTS {
        return Err(RpcError::Validation {
            field: "frame_parts".to_string(),
            message: format!(
                "message has {} parts, maximum is {}",
                count,
                ProtocolConfig::MAX_FRAME_PARTS
            ),
        });
    }

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > ProtocolConfig::MAX_FRAME_SIZE {
            return Err(RpcError::Validation {
                field: "frame_size".to_string(),
                message: format!(
                    "frame size {} exceeds maximum {}",
                    len,
                    ProtocolConfig::MAX_FRAME_SIZE
                ),
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        parts.push(Bytes::from(payload));
    }

    Ok(Some(parts))
}

/// Write one multi-part message to an async writer.
///
/// Messages the reading side would reject are refused before any byte is written.
pub async fn write_multipart<W: AsyncWriteExt + Unpin>(writer: &mut W, parts: &[Bytes]) -> Result<()> {
    if parts.len() > ProtocolConfig::MAX_FRAME_PARTS {
        return Err(RpcError::Validation {
            field: "frame_parts".to_string(),
            message: format!(
                "message has {} parts, maximum is {}",
                parts.len(),
                ProtocolConfig::MAX_FRAME_PARTS
            ),
        });
    }
    if let Some(part) = parts.iter().find(|p| p.len() > ProtocolConfig::MAX_FRAME_SIZE) {
        return Err(RpcError::Validation {
            field: "frame_size".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                part.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut buf = Vec::with_capacity(4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>());
    buf.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
