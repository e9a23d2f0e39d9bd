//! Length-prefixed bincode framing.
//!
//! Every TCP connection in the system, peer-to-peer or client-to-node,
//! carries frames of a `u32` big-endian length followed by a bincode
//! body. The peer listener, the peer transport, and the TCP client
//! transport all share these two functions so the framing can never
//! drift between them.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Large enough for a snapshot chunk plus
/// envelope, small enough to bound memory per connection.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Serializes `message` and writes it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message).map_err(invalid_data)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame and deserializes it. A clean disconnect between
/// frames surfaces as [`io::ErrorKind::UnexpectedEof`].
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(invalid_data)
}

fn invalid_data(error: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}
