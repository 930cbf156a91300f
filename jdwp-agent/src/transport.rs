// JDWP transport framing
//
// Moves length-prefixed frames over a byte stream. No packet semantics here:
// a frame is the raw packet including its 4-byte length prefix.

use crate::protocol::{JdwpError, JdwpResult, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum allowed JDWP packet size (10MB)
/// This prevents memory exhaustion from malicious or buggy debuggers
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Read one complete frame.
///
/// A clean end-of-stream on a frame boundary yields `ConnectionClosed`; an
/// end-of-stream inside a frame yields an `UnexpectedEof` I/O error. The
/// caller decides whether either is fatal.
pub async fn read_frame<R>(reader: &mut R) -> JdwpResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(JdwpError::ConnectionClosed);
            }
            return Err(JdwpError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let declared = i32::from_be_bytes(prefix);
    if declared < HEADER_SIZE as i32 {
        return Err(JdwpError::Protocol(format!(
            "Invalid packet length: {}",
            declared
        )));
    }

    let length = declared as usize;
    if length > MAX_FRAME_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut frame = vec![0u8; length];
    frame[..LENGTH_PREFIX].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[LENGTH_PREFIX..]).await?;

    debug!("Read frame of {} bytes", length);
    Ok(frame)
}

/// Write one complete frame and flush it.
///
/// Only the sender task owns the writer, so a frame is never interleaved with
/// another one.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> JdwpResult<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(JdwpError::Protocol(format!(
            "Frame length mismatch: declared {}, actual {}",
            declared,
            frame.len()
        )));
    }

    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
