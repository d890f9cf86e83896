//! Data-plane messages
//!
//! After a successful import the connection speaks URB traffic: the
//! client sends `USBIP_CMD_SUBMIT`/`USBIP_CMD_UNLINK`, the server
//! answers `USBIP_RET_SUBMIT`/`USBIP_RET_UNLINK`. Every message is a
//! fixed 48-byte header (shared 20-byte prefix plus 28 command-specific
//! bytes) optionally followed by payload: OUT data after `CMD_SUBMIT`,
//! IN data after a successful `RET_SUBMIT`.

use crate::codec::MAX_TRANSFER_LEN;
use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

/// Submit a URB to the exported device
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Cancel a previously submitted URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Completion reply for `CMD_SUBMIT`
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply for `CMD_UNLINK`
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// A URB request decoded from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbRequest {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

impl UrbRequest {
    /// Fixed header size shared by all data-plane messages
    pub const HEADER_SIZE: usize = 48;

    /// Decode the fixed 48-byte header of a client request
    ///
    /// The OUT payload of a `CMD_SUBMIT` is not part of the header; the
    /// returned command has an empty payload and
    /// [`CmdSubmit::out_payload_len`] tells the caller how many bytes
    /// follow on the wire. Reply commands and unknown codes are rejected.
    pub fn decode_head(buf: &[u8; Self::HEADER_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let command = cursor.read_u32::<BigEndian>()?;
        let seqnum = cursor.read_u32::<BigEndian>()?;
        let devid = cursor.read_u32::<BigEndian>()?;
        let direction = Direction::from_wire(cursor.read_u32::<BigEndian>()?)?;
        let ep = cursor.read_u32::<BigEndian>()?;

        match command {
            USBIP_CMD_SUBMIT => {
                let transfer_flags = cursor.read_u32::<BigEndian>()?;
                let transfer_buffer_length = cursor.read_u32::<BigEndian>()?;
                let start_frame = cursor.read_u32::<BigEndian>()?;
                let number_of_packets = cursor.read_u32::<BigEndian>()?;
                let interval = cursor.read_u32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                cursor.read_exact(&mut setup)?;

                if transfer_buffer_length as usize > MAX_TRANSFER_LEN {
                    return Err(ProtocolError::TransferTooLarge {
                        len: transfer_buffer_length as usize,
                        max: MAX_TRANSFER_LEN,
                    });
                }

                Ok(Self::Submit(CmdSubmit {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                    payload: Bytes::new(),
                }))
            }
            USBIP_CMD_UNLINK => {
                let unlink_seqnum = cursor.read_u32::<BigEndian>()?;
                Ok(Self::Unlink(CmdUnlink {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    unlink_seqnum,
                }))
            }
            other => Err(ProtocolError::UnknownUrbCommand(other)),
        }
    }

    /// Read one full request, OUT payload included
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; Self::HEADER_SIZE];
        reader.read_exact(&mut head)?;
        let mut request = Self::decode_head(&head)?;

        if let Self::Submit(ref mut cmd) = request {
            let wanted = cmd.out_payload_len();
            if wanted > 0 {
                let mut payload = vec![0u8; wanted];
                reader.read_exact(&mut payload)?;
                cmd.payload = Bytes::from(payload);
            }
        }

        Ok(request)
    }

    pub fn seqnum(&self) -> u32 {
        match self {
            Self::Submit(cmd) => cmd.seqnum,
            Self::Unlink(cmd) => cmd.seqnum,
        }
    }
}

/// `USBIP_CMD_SUBMIT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number without the direction bit (0-15)
    pub ep: u32,
    pub transfer_flags: u32,
    /// Requested length: OUT payload size, or IN buffer size
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Setup packet for control transfers, all zero otherwise
    pub setup: [u8; 8],
    /// OUT data; empty for IN submissions
    pub payload: Bytes,
}

impl CmdSubmit {
    /// Number of payload bytes that follow the header on the wire
    pub fn out_payload_len(&self) -> usize {
        match self.direction {
            Direction::Out => self.transfer_buffer_length as usize,
            Direction::In => 0,
        }
    }

    /// True when the setup packet is populated (control transfer)
    pub fn has_setup(&self) -> bool {
        self.setup != [0u8; 8]
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(USBIP_CMD_SUBMIT)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction.to_wire())?;
        writer.write_u32::<BigEndian>(self.ep)?;
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)?;
        if self.direction == Direction::Out {
            writer.write_all(&self.payload)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(UrbRequest::HEADER_SIZE + self.payload.len());
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// `USBIP_CMD_UNLINK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// Sequence number of the URB to cancel
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(USBIP_CMD_UNLINK)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction.to_wire())?;
        writer.write_u32::<BigEndian>(self.ep)?;
        writer.write_u32::<BigEndian>(self.unlink_seqnum)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(UrbRequest::HEADER_SIZE);
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// `USBIP_RET_SUBMIT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// IN data; empty for OUT completions and failures
    pub payload: Bytes,
}

impl RetSubmit {
    /// Build a successful completion; for IN transfers `payload` is the
    /// received data and `actual_length` matches it, for OUT transfers
    /// `payload` is empty and `actual_length` is the bytes written.
    pub fn success(cmd: &CmdSubmit, actual_length: u32, payload: Bytes) -> Self {
        Self {
            seqnum: cmd.seqnum,
            devid: cmd.devid,
            direction: cmd.direction,
            ep: cmd.ep,
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            payload,
        }
    }

    /// Build a failed completion; no payload follows
    pub fn error(cmd: &CmdSubmit, status: i32) -> Self {
        Self {
            seqnum: cmd.seqnum,
            devid: cmd.devid,
            direction: cmd.direction,
            ep: cmd.ep,
            status,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            payload: Bytes::new(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(USBIP_RET_SUBMIT)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction.to_wire())?;
        writer.write_u32::<BigEndian>(self.ep)?;
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.error_count)?;
        writer.write_all(&[0u8; 8])?;
        if self.direction == Direction::In && self.status == 0 {
            writer.write_all(&self.payload)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(UrbRequest::HEADER_SIZE + self.payload.len());
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Read one full completion, IN payload included
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; UrbRequest::HEADER_SIZE];
        reader.read_exact(&mut head)?;

        let mut cursor = Cursor::new(&head[..]);
        let command = cursor.read_u32::<BigEndian>()?;
        if command != USBIP_RET_SUBMIT {
            return Err(ProtocolError::UnknownUrbCommand(command));
        }
        let seqnum = cursor.read_u32::<BigEndian>()?;
        let devid = cursor.read_u32::<BigEndian>()?;
        let direction = Direction::from_wire(cursor.read_u32::<BigEndian>()?)?;
        let ep = cursor.read_u32::<BigEndian>()?;
        let status = cursor.read_i32::<BigEndian>()?;
        let actual_length = cursor.read_u32::<BigEndian>()?;
        let start_frame = cursor.read_u32::<BigEndian>()?;
        let number_of_packets = cursor.read_u32::<BigEndian>()?;
        let error_count = cursor.read_u32::<BigEndian>()?;

        if actual_length as usize > MAX_TRANSFER_LEN {
            return Err(ProtocolError::TransferTooLarge {
                len: actual_length as usize,
                max: MAX_TRANSFER_LEN,
            });
        }

        let payload = if direction == Direction::In && status == 0 && actual_length > 0 {
            let mut buf = vec![0u8; actual_length as usize];
            reader.read_exact(&mut buf)?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        Ok(Self {
            seqnum,
            devid,
            direction,
            ep,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            payload,
        })
    }
}

/// `USBIP_RET_UNLINK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    /// 0 when the unlink was accepted, negative errno otherwise
    pub status: i32,
}

impl RetUnlink {
    pub fn new(cmd: &CmdUnlink, status: i32) -> Self {
        Self {
            seqnum: cmd.seqnum,
            status,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(USBIP_RET_UNLINK)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        // devid, direction and ep are meaningless in unlink replies
        writer.write_all(&[0u8; 12])?;
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(UrbRequest::HEADER_SIZE);
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; UrbRequest::HEADER_SIZE];
        reader.read_exact(&mut head)?;

        let mut cursor = Cursor::new(&head[..]);
        let command = cursor.read_u32::<BigEndian>()?;
        if command != USBIP_RET_UNLINK {
            return Err(ProtocolError::UnknownUrbCommand(command));
        }
        let seqnum = cursor.read_u32::<BigEndian>()?;
        cursor.set_position(20);
        let status = cursor.read_i32::<BigEndian>()?;

        Ok(Self { seqnum, status })
    }
}
