//! Frame codec for the REPL channel.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │  op (1B) │   JSON payload         │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(op byte) + sizeof(payload), NOT including the 4-byte prefix.
//! Requests go out on the input socket, replies come back on the output
//! socket tagged with the same op.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest frame accepted from a kernel.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReplOp {
    Status = 0x01,
    Complete = 0x02,
    Interrupt = 0x03,
    StartService = 0x04,
    StartModelService = 0x05,
    ShutdownService = 0x06,
    ServiceApps = 0x07,
    /// Unsolicited console output; not routed to a request queue.
    Console = 0x20,
}

impl ReplOp {
    pub const REQUESTS: [ReplOp; 7] = [
        ReplOp::Status,
        ReplOp::Complete,
        ReplOp::Interrupt,
        ReplOp::StartService,
        ReplOp::StartModelService,
        ReplOp::ShutdownService,
        ReplOp::ServiceApps,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ReplOp::Status),
            0x02 => Some(ReplOp::Complete),
            0x03 => Some(ReplOp::Interrupt),
            0x04 => Some(ReplOp::StartService),
            0x05 => Some(ReplOp::StartModelService),
            0x06 => Some(ReplOp::ShutdownService),
            0x07 => Some(ReplOp::ServiceApps),
            0x20 => Some(ReplOp::Console),
            _ => None,
        }
    }
}

/// Read one frame. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing op byte",
        ));
    }

    let mut frame = BytesMut::zeroed(frame_len as usize);
    reader.read_exact(&mut frame).await?;
    let op = frame[0];
    let payload = frame.split_off(1).freeze();
    Ok(Some((op, payload)))
}

/// Write one frame in a single buffered write.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    op: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload exceeds frame limit")
    })?;
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u32(frame_len);
    buf.put_u8(op);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
