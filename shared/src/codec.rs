//! Length-prefixed bincode framing over async streams.
//!
//! One frame is a big-endian `u32` body length followed by the bincode
//! body. Handshakes and business messages use the same functions; only
//! the expected type differs.

use crate::error::NetError;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body. Anything larger is a corrupt or
/// hostile stream, not a legitimate message.
pub const MAX_FRAME_LEN: u32 = 256 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(NetError::FrameTooLarge(body.len() as u32));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, NetError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}
