//! Length-prefixed framing for the TCP adapter.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::TransportConfig;
use crate::error::{CommError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame and decode it as UTF-8 text.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(CommError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| CommError::Protocol {
            message: "invalid UTF-8 in frame".to_string(),
        })
}

/// Write one text frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    if text.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(CommError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                text.len(),
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = text.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
