//! Length-prefixed stream framing.
//!
//! Frame format on the wire:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ProtocolConfig;
use crate::{CrossrunError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(CrossrunError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
