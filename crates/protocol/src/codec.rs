//! Low-level codec helpers
//!
//! Fixed-width string fields and the async frame readers used by the
//! server's receive loops. All multi-byte integers in USB/IP are
//! big-endian; string fields are fixed-width and null-padded.

use crate::error::Result;
use std::io::{Read, Write};

#[cfg(feature = "async")]
use crate::error::ProtocolError;
#[cfg(feature = "async")]
use crate::op::{OpHeader, OpRequest};
#[cfg(feature = "async")]
use crate::urb::UrbRequest;

#[cfg(feature = "async")]
use bytes::Bytes;
#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single transfer buffer (16 MiB)
///
/// A `CMD_SUBMIT` announcing more than this is treated as malformed so a
/// misbehaving client cannot make the server allocate arbitrary memory.
pub const MAX_TRANSFER_LEN: usize = 16 * 1024 * 1024;

/// Read a fixed-width, null-padded string field
///
/// Devices are known to return strings with embedded NULs followed by
/// garbage, so everything from the first NUL on is discarded. Non-UTF-8
/// bytes are replaced rather than rejected.
pub fn read_fixed_str<R: Read>(reader: &mut R, width: usize) -> Result<String> {
    let mut buf = vec![0u8; width];
    reader.read_exact(&mut buf)?;

    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Write a string into a fixed-width, null-padded field
///
/// Values longer than the field are truncated.
pub fn write_fixed_str<W: Write>(writer: &mut W, value: &str, width: usize) -> Result<()> {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    writer.write_all(&bytes[..len])?;

    let padding = vec![0u8; width - len];
    writer.write_all(&padding)?;
    Ok(())
}

/// Async: read one handshake request from a client socket
///
/// Reads the 8-byte op header, validates version and code, and reads the
/// request body (the bus id for `OP_REQ_IMPORT`).
#[cfg(feature = "async")]
pub async fn read_op_request<R>(reader: &mut R) -> Result<OpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; OpHeader::SIZE];
    reader.read_exact(&mut head).await?;
    let header = OpHeader::decode(&head)?;

    match header.code {
        crate::op::OP_REQ_DEVLIST => Ok(OpRequest::Devlist),
        crate::op::OP_REQ_IMPORT => {
            let mut busid = [0u8; crate::types::BUS_ID_LEN];
            reader.read_exact(&mut busid).await?;
            let busid = read_fixed_str(&mut &busid[..], crate::types::BUS_ID_LEN)?;
            Ok(OpRequest::Import { busid })
        }
        other => Err(ProtocolError::UnknownOpCode(other)),
    }
}

/// Async: read one URB request from a client socket
///
/// Reads the fixed 48-byte header and, for OUT submissions, the payload
/// that follows it. Returns `Err(Io)` with `UnexpectedEof` on a clean
/// connection close between frames.
#[cfg(feature = "async")]
pub async fn read_urb_request<R>(reader: &mut R) -> Result<UrbRequest>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; UrbRequest::HEADER_SIZE];
    reader.read_exact(&mut head).await?;
    let mut request = UrbRequest::decode_head(&head)?;

    if let UrbRequest::Submit(ref mut cmd) = request {
        let wanted = cmd.out_payload_len();
        if wanted > 0 {
            let mut payload = vec![0u8; wanted];
            reader.read_exact(&mut payload).await?;
            cmd.payload = Bytes::from(payload);
        }
    }

    Ok(request)
}
