//! Shared wire-level types
//!
//! Device and interface description blocks as they appear inside
//! `OP_REP_DEVLIST` and `OP_REP_IMPORT`, plus the enumerations (speed,
//! direction, operation status) used across the protocol.

use crate::codec::{read_fixed_str, write_fixed_str};
use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Width of the sysfs path field in device blocks
pub const SYSFS_PATH_LEN: usize = 256;

/// Width of the bus id field in device blocks and import requests
pub const BUS_ID_LEN: usize = 32;

/// USB device speed codes as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
    SuperPlus = 6,
}

impl DeviceSpeed {
    /// Map a wire code to a speed, defaulting to `Unknown` for codes we
    /// don't know about (the field is informational, not structural).
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Transfer direction, host-relative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

impl Direction {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Out => write!(f, "OUT"),
            Self::In => write!(f, "IN"),
        }
    }
}

/// Status codes for handshake replies
///
/// Carried in the status field of `OP_REP_DEVLIST` and `OP_REP_IMPORT`.
/// Replies keep the raw `u32` so unknown codes survive a decode/encode
/// round trip; this enum is for constructing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpStatus {
    Ok = 0,
    /// Device exists but is not exported
    Unavailable = 1,
    /// Device is already claimed by another session
    DeviceBusy = 2,
    /// Claiming the device failed (permissions, kernel driver)
    DeviceError = 3,
    /// No device with the requested bus id
    NoDevice = 4,
    /// Unexpected server-side failure
    Error = 5,
}

impl OpStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Interface description entry in an `OP_REP_DEVLIST` device block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceRecord {
    /// Size on the wire (three class bytes plus one pad byte)
    pub const SIZE: usize = 4;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let _pad = reader.read_u8()?;
        Ok(Self {
            class,
            subclass,
            protocol,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.class)?;
        writer.write_u8(self.subclass)?;
        writer.write_u8(self.protocol)?;
        writer.write_u8(0)?;
        Ok(())
    }
}

/// Device description block
///
/// The fixed 0x138-byte block shared by `OP_REP_DEVLIST` and
/// `OP_REP_IMPORT`. The devlist variant is followed by
/// `num_interfaces` [`InterfaceRecord`] entries; the import variant is
/// not, so `num_interfaces` is kept as an explicit field rather than
/// derived from `interfaces.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Path of the device on the exporting host (e.g. sysfs path)
    pub path: String,
    /// Stable bus id, e.g. `1-4.3`
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    /// Interface entries; populated for devlist blocks, empty for import
    pub interfaces: Vec<InterfaceRecord>,
}

impl DeviceRecord {
    /// Size of the bare block on the wire, excluding interface entries
    pub const SIZE: usize = SYSFS_PATH_LEN + BUS_ID_LEN + 3 * 4 + 3 * 2 + 6;

    /// Read the bare device block; interface entries are the caller's job
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let path = read_fixed_str(reader, SYSFS_PATH_LEN)?;
        let busid = read_fixed_str(reader, BUS_ID_LEN)?;
        let busnum = reader.read_u32::<BigEndian>()?;
        let devnum = reader.read_u32::<BigEndian>()?;
        let speed = DeviceSpeed::from_wire(reader.read_u32::<BigEndian>()?);
        let vendor_id = reader.read_u16::<BigEndian>()?;
        let product_id = reader.read_u16::<BigEndian>()?;
        let bcd_device = reader.read_u16::<BigEndian>()?;
        let device_class = reader.read_u8()?;
        let device_subclass = reader.read_u8()?;
        let device_protocol = reader.read_u8()?;
        let configuration_value = reader.read_u8()?;
        let num_configurations = reader.read_u8()?;
        let num_interfaces = reader.read_u8()?;

        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
            interfaces: Vec::new(),
        })
    }

    /// Write the bare device block; interface entries are the caller's job
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_fixed_str(writer, &self.path, SYSFS_PATH_LEN)?;
        write_fixed_str(writer, &self.busid, BUS_ID_LEN)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed.to_wire())?;
        writer.write_u16::<BigEndian>(self.vendor_id)?;
        writer.write_u16::<BigEndian>(self.product_id)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            path: "/sys/bus/usb/devices/1-4.3".to_string(),
            busid: "1-4.3".to_string(),
            busnum: 1,
            devnum: 7,
            speed: DeviceSpeed::High,
            vendor_id: 0x046d,
            product_id: 0xc52b,
            bcd_device: 0x1201,
            device_class: 0x00,
            device_subclass: 0x00,
            device_protocol: 0x00,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 2,
            interfaces: Vec::new(),
        }
    }

    #[test]
    fn test_device_record_size() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), DeviceRecord::SIZE);
        assert_eq!(DeviceRecord::SIZE, 0x138);
    }

    #[test]
    fn test_device_record_roundtrip() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(&buf);
        let decoded = DeviceRecord::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, record);

        let mut reencoded = Vec::new();
        decoded.write_to(&mut reencoded).unwrap();
        assert_eq!(reencoded, buf);
    }

    #[test]
    fn test_interface_record_roundtrip() {
        let iface = InterfaceRecord {
            class: 0x03,
            subclass: 0x01,
            protocol: 0x02,
        };
        let mut buf = Vec::new();
        iface.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), InterfaceRecord::SIZE);

        let decoded = InterfaceRecord::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, iface);
    }

    #[test]
    fn test_direction_from_wire() {
        assert_eq!(Direction::from_wire(0).unwrap(), Direction::Out);
        assert_eq!(Direction::from_wire(1).unwrap(), Direction::In);
        assert!(matches!(
            Direction::from_wire(2),
            Err(ProtocolError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_speed_unknown_codes_collapse() {
        assert_eq!(DeviceSpeed::from_wire(3), DeviceSpeed::High);
        assert_eq!(DeviceSpeed::from_wire(99), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_truncated_record() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf.truncate(100);

        let result = DeviceRecord::read_from(&mut Cursor::new(&buf));
        assert!(result.is_err());
    }
}
