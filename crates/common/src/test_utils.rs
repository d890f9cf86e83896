//! Test utilities
//!
//! Ready-made device snapshots for exercising the protocol engine
//! without hardware.

use crate::usb_types::{DeviceSnapshot, EndpointDescriptor, TransferKind};
use protocol::{
    DeviceRecord, DeviceSpeed, InterfaceRecord, ProtocolError, RetSubmit, RetUnlink,
    USBIP_RET_SUBMIT, USBIP_RET_UNLINK, UrbRequest,
};
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound an async test step so a regression hangs the test, not CI
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Build a wire device record for the given bus id
///
/// Models a HID-class composite device on bus 1, device number 4.
pub fn sample_record(busid: &str) -> DeviceRecord {
    DeviceRecord {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid: busid.to_string(),
        busnum: 1,
        devnum: 4,
        speed: DeviceSpeed::Full,
        vendor_id: 0x046d,
        product_id: 0xc52b,
        bcd_device: 0x1201,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
        interfaces: vec![InterfaceRecord {
            class: 0x03,
            subclass: 0x01,
            protocol: 0x01,
        }],
    }
}

/// Build a snapshot with an interrupt IN endpoint (0x81) and a bulk
/// OUT/IN pair (0x02/0x82)
pub fn sample_snapshot(busid: &str) -> DeviceSnapshot {
    DeviceSnapshot {
        record: sample_record(busid),
        manufacturer: Some("Logitech".to_string()),
        product: Some("USB Receiver".to_string()),
        serial_number: None,
        endpoints: vec![
            EndpointDescriptor {
                address: 0x81,
                kind: TransferKind::Interrupt,
                max_packet_size: 8,
                interval: 8,
            },
            EndpointDescriptor {
                address: 0x02,
                kind: TransferKind::Bulk,
                max_packet_size: 64,
                interval: 0,
            },
            EndpointDescriptor {
                address: 0x82,
                kind: TransferKind::Bulk,
                max_packet_size: 64,
                interval: 0,
            },
        ],
    }
}

/// A server reply on the URB plane
#[derive(Debug)]
pub enum UrbReply {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}

/// Read one server reply from a stream, payload included
///
/// Test-side counterpart of the session's reply writer; the production
/// client for these frames is the kernel's vhci driver.
pub async fn read_urb_reply<R>(reader: &mut R) -> protocol::Result<UrbReply>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; UrbRequest::HEADER_SIZE];
    reader.read_exact(&mut head).await?;

    let command = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    match command {
        USBIP_RET_SUBMIT => {
            let direction = u32::from_be_bytes([head[12], head[13], head[14], head[15]]);
            let status = i32::from_be_bytes([head[20], head[21], head[22], head[23]]);
            let actual_length = u32::from_be_bytes([head[24], head[25], head[26], head[27]]);

            let mut frame = head.to_vec();
            if direction == 1 && status == 0 && actual_length > 0 {
                let mut payload = vec![0u8; actual_length as usize];
                reader.read_exact(&mut payload).await?;
                frame.extend_from_slice(&payload);
            }

            Ok(UrbReply::Submit(RetSubmit::read_from(&mut Cursor::new(
                frame,
            ))?))
        }
        USBIP_RET_UNLINK => Ok(UrbReply::Unlink(RetUnlink::read_from(&mut Cursor::new(
            &head[..],
        ))?)),
        other => Err(ProtocolError::UnknownUrbCommand(other)),
    }
}

/// Build a snapshot for a mass storage device
pub fn sample_storage_snapshot(busid: &str) -> DeviceSnapshot {
    let mut record = sample_record(busid);
    record.vendor_id = 0x0781;
    record.product_id = 0x5581;
    record.device_class = 0x00;
    record.interfaces = vec![InterfaceRecord {
        class: 0x08,
        subclass: 0x06,
        protocol: 0x50,
    }];

    DeviceSnapshot {
        record,
        manufacturer: Some("SanDisk".to_string()),
        product: Some("Ultra".to_string()),
        serial_number: Some("4C530001".to_string()),
        endpoints: vec![
            EndpointDescriptor {
                address: 0x81,
                kind: TransferKind::Bulk,
                max_packet_size: 512,
                interval: 0,
            },
            EndpointDescriptor {
                address: 0x02,
                kind: TransferKind::Bulk,
                max_packet_size: 512,
                interval: 0,
            },
        ],
    }
}
