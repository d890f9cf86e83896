//! Handshake messages
//!
//! The one-shot `OP_REQ_*`/`OP_REP_*` exchange a client performs on a
//! fresh connection, before any URB traffic: device listing
//! (`OP_REQ_DEVLIST`/`OP_REP_DEVLIST`) and device import
//! (`OP_REQ_IMPORT`/`OP_REP_IMPORT`). Every message starts with the same
//! 8-byte header: protocol version, operation code, status.

use crate::codec::{read_fixed_str, write_fixed_str};
use crate::error::{ProtocolError, Result};
use crate::types::{BUS_ID_LEN, DeviceRecord, InterfaceRecord};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

/// USB/IP protocol version (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Default TCP port of a USB/IP server
pub const USBIP_PORT: u16 = 3240;

/// Request the list of exported devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply carrying the list of exported devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Request to import (attach) one exported device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply to an import request
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Common 8-byte header of every handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub const SIZE: usize = 8;

    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    /// Decode a header from exactly [`OpHeader::SIZE`] bytes
    ///
    /// Fails on short input and on a version we do not speak. The code is
    /// returned as-is; whether it is meaningful in context is the
    /// caller's concern.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                got: buf.len(),
            });
        }

        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u16::<BigEndian>()?;
        let code = cursor.read_u16::<BigEndian>()?;
        let status = cursor.read_u32::<BigEndian>()?;

        if version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            code,
            status,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// A decoded handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    Devlist,
    Import { busid: String },
}

/// `OP_REQ_DEVLIST`: header only
#[derive(Debug, Clone, Copy, Default)]
pub struct OpReqDevlist;

impl OpReqDevlist {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        OpHeader::new(OP_REQ_DEVLIST, 0).write_to(writer)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(OpHeader::SIZE);
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// `OP_REQ_IMPORT`: header plus the requested bus id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReqImport {
    pub busid: String,
}

impl OpReqImport {
    pub const SIZE: usize = OpHeader::SIZE + BUS_ID_LEN;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        OpHeader::new(OP_REQ_IMPORT, 0).write_to(writer)?;
        write_fixed_str(writer, &self.busid, BUS_ID_LEN)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// `OP_REP_DEVLIST`: status, device count, then one block per device
/// with its interface entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRepDevlist {
    pub status: u32,
    pub devices: Vec<DeviceRecord>,
}

impl OpRepDevlist {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        OpHeader::new(OP_REP_DEVLIST, self.status).write_to(writer)?;
        writer.write_u32::<BigEndian>(self.devices.len() as u32)?;
        for device in &self.devices {
            device.write_to(writer)?;
            for interface in &device.interfaces {
                interface.write_to(writer)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decode a full devlist reply, header included
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; OpHeader::SIZE];
        reader.read_exact(&mut head)?;
        let header = OpHeader::decode(&head)?;
        if header.code != OP_REP_DEVLIST {
            return Err(ProtocolError::UnknownOpCode(header.code));
        }

        let count = reader.read_u32::<BigEndian>()?;
        let mut devices = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            let mut device = DeviceRecord::read_from(reader)?;
            for _ in 0..device.num_interfaces {
                device.interfaces.push(InterfaceRecord::read_from(reader)?);
            }
            devices.push(device);
        }

        Ok(Self {
            status: header.status,
            devices,
        })
    }
}

/// `OP_REP_IMPORT`: status, then the device block when status is 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRepImport {
    pub status: u32,
    pub device: Option<DeviceRecord>,
}

impl OpRepImport {
    /// Build a successful reply for an imported device
    pub fn success(device: DeviceRecord) -> Self {
        Self {
            status: 0,
            device: Some(device),
        }
    }

    /// Build a failure reply; no device block follows
    pub fn error(status: u32) -> Self {
        Self {
            status,
            device: None,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        OpHeader::new(OP_REP_IMPORT, self.status).write_to(writer)?;
        if let Some(ref device) = self.device {
            device.write_to(writer)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decode a full import reply, header included
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; OpHeader::SIZE];
        reader.read_exact(&mut head)?;
        let header = OpHeader::decode(&head)?;
        if header.code != OP_REP_IMPORT {
            return Err(ProtocolError::UnknownOpCode(header.code));
        }

        let device = if header.status == 0 {
            Some(DeviceRecord::read_from(reader)?)
        } else {
            None
        };

        Ok(Self {
            status: header.status,
            device,
        })
    }
}
