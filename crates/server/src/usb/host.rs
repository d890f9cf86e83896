//! libusb-backed device backend
//!
//! Enumerates devices through rusb and executes transfers with the
//! synchronous rusb API. Blocking calls run inside
//! `tokio::task::spawn_blocking` so a slow device never stalls the
//! async runtime; cancellation of an already-started call simply means
//! its eventual result is discarded.

use super::backend::{DeviceClaim, UsbBackend};
use bytes::Bytes;
use common::usb_types::{
    ClaimError, DeviceSnapshot, EndpointDescriptor, InFlightTransfer, TransferError, TransferKind,
    TransferOutcome, TransferRequest, TransferResult, transfer_pair,
};
use protocol::{DeviceRecord, DeviceSpeed, InterfaceRecord};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for USB transfers (5 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Device backend talking to real hardware through libusb
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> common::Result<Self> {
        let context = Context::new().map_err(|e| common::Error::Usb(e.to_string()))?;
        Ok(Self { context })
    }
}

impl UsbBackend for RusbBackend {
    type Claim = RusbClaim;

    fn devices(&self) -> common::Result<Vec<DeviceSnapshot>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| common::Error::Usb(e.to_string()))?;

        let mut snapshots = Vec::new();
        for device in devices.iter() {
            match snapshot_device(&device) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    // Some devices refuse descriptor reads (hubs on
                    // certain hosts, devices mid-reset); skip them
                    debug!(
                        "Skipping device {:03}:{:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                }
            }
        }

        Ok(snapshots)
    }

    fn claim(&self, bus_id: &str) -> Result<Self::Claim, ClaimError> {
        let device = find_device(&self.context, bus_id)
            .map_err(|e| ClaimError::Other(e.to_string()))?
            .ok_or_else(|| ClaimError::NotFound(bus_id.to_string()))?;

        let snapshot =
            snapshot_device(&device).map_err(|e| ClaimError::Other(e.to_string()))?;

        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open {}: {}", bus_id, e);
            match e {
                rusb::Error::Access => ClaimError::PermissionDenied(bus_id.to_string()),
                rusb::Error::NotFound => ClaimError::NotFound(bus_id.to_string()),
                rusb::Error::Busy => ClaimError::AlreadyClaimed(bus_id.to_string()),
                other => ClaimError::Other(other.to_string()),
            }
        })?;

        let claimed = claim_interfaces(&mut handle, &device)
            .map_err(|e| ClaimError::Other(e))?;

        debug!("Claimed {} ({} interfaces)", bus_id, claimed.len());
        Ok(RusbClaim {
            inner: Arc::new(ClaimInner {
                handle,
                snapshot,
                claimed_interfaces: claimed,
            }),
        })
    }
}

/// Detach kernel drivers and claim every interface of the active
/// configuration, unwinding what was claimed on failure
fn claim_interfaces(
    handle: &mut DeviceHandle<Context>,
    device: &Device<Context>,
) -> Result<Vec<u8>, String> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| format!("no active configuration: {}", e))?;

    let mut claimed = Vec::new();
    for interface in config.interfaces() {
        let number = interface.number();

        match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                if let Err(e) = handle.detach_kernel_driver(number) {
                    warn!("Failed to detach kernel driver from interface {}: {}", number, e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!("Kernel driver query failed for interface {}: {}", number, e);
            }
        }

        if let Err(e) = handle.claim_interface(number) {
            for prev in &claimed {
                let _ = handle.release_interface(*prev);
                let _ = handle.attach_kernel_driver(*prev);
            }
            return Err(format!("failed to claim interface {}: {}", number, e));
        }
        claimed.push(number);
    }

    Ok(claimed)
}

struct ClaimInner {
    handle: DeviceHandle<Context>,
    snapshot: DeviceSnapshot,
    claimed_interfaces: Vec<u8>,
}

impl Drop for ClaimInner {
    fn drop(&mut self) {
        for interface in &self.claimed_interfaces {
            if let Err(e) = self.handle.release_interface(*interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            // Hand the device back to whatever drove it before us
            if let Err(e) = self.handle.attach_kernel_driver(*interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        debug!("Released {}", self.snapshot.busid());
    }
}

/// Exclusive claim on one physical device
pub struct RusbClaim {
    inner: Arc<ClaimInner>,
}

impl DeviceClaim for RusbClaim {
    fn snapshot(&self) -> &DeviceSnapshot {
        &self.inner.snapshot
    }

    fn submit(&self, request: TransferRequest) -> InFlightTransfer {
        let (completer, inflight) = transfer_pair();
        let inner = self.inner.clone();

        tokio::task::spawn_blocking(move || {
            if completer.is_cancelled() {
                return;
            }
            let result = execute_transfer(&inner.handle, &request);
            completer.complete(result);
        });

        inflight
    }
}

/// Run one blocking transfer against an open device handle
fn execute_transfer(handle: &DeviceHandle<Context>, request: &TransferRequest) -> TransferResult {
    match request.kind {
        TransferKind::Control => execute_control(handle, request),
        TransferKind::Bulk => execute_bulk(handle, request),
        TransferKind::Interrupt => execute_interrupt(handle, request),
        // The synchronous libusb API has no isochronous path
        TransferKind::Isochronous => Err(TransferError::InvalidParam),
    }
}

fn execute_control(handle: &DeviceHandle<Context>, request: &TransferRequest) -> TransferResult {
    // Setup packet layout: bmRequestType, bRequest, wValue, wIndex,
    // wLength, the words little-endian per USB spec
    let request_type = request.setup[0];
    let b_request = request.setup[1];
    let value = u16::from_le_bytes([request.setup[2], request.setup[3]]);
    let index = u16::from_le_bytes([request.setup[4], request.setup[5]]);

    debug!(
        "Control transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
        request_type, b_request, value, index, request.length
    );

    let is_in = (request_type & 0x80) != 0;
    if is_in {
        let mut buffer = vec![0u8; request.length];
        match handle.read_control(request_type, b_request, value, index, &mut buffer, DEFAULT_TIMEOUT)
        {
            Ok(len) => {
                buffer.truncate(len);
                Ok(TransferOutcome::received(Bytes::from(buffer)))
            }
            Err(e) => Err(map_rusb_error(e)),
        }
    } else {
        match handle.write_control(
            request_type,
            b_request,
            value,
            index,
            &request.payload,
            DEFAULT_TIMEOUT,
        ) {
            Ok(len) => Ok(TransferOutcome::written(len)),
            Err(e) => Err(map_rusb_error(e)),
        }
    }
}

fn execute_bulk(handle: &DeviceHandle<Context>, request: &TransferRequest) -> TransferResult {
    let address = request.address();
    debug!(
        "Bulk transfer: endpoint={:#04x}, length={}",
        address, request.length
    );

    if address & 0x80 != 0 {
        let mut buffer = vec![0u8; request.length];
        match handle.read_bulk(address, &mut buffer, DEFAULT_TIMEOUT) {
            Ok(len) => {
                buffer.truncate(len);
                Ok(TransferOutcome::received(Bytes::from(buffer)))
            }
            Err(e) => Err(map_rusb_error(e)),
        }
    } else {
        match handle.write_bulk(address, &request.payload, DEFAULT_TIMEOUT) {
            Ok(len) => Ok(TransferOutcome::written(len)),
            Err(e) => Err(map_rusb_error(e)),
        }
    }
}

fn execute_interrupt(handle: &DeviceHandle<Context>, request: &TransferRequest) -> TransferResult {
    let address = request.address();
    debug!(
        "Interrupt transfer: endpoint={:#04x}, length={}",
        address, request.length
    );

    if address & 0x80 != 0 {
        let mut buffer = vec![0u8; request.length];
        match handle.read_interrupt(address, &mut buffer, DEFAULT_TIMEOUT) {
            Ok(len) => {
                buffer.truncate(len);
                Ok(TransferOutcome::received(Bytes::from(buffer)))
            }
            Err(e) => Err(map_rusb_error(e)),
        }
    } else {
        match handle.write_interrupt(address, &request.payload, DEFAULT_TIMEOUT) {
            Ok(len) => Ok(TransferOutcome::written(len)),
            Err(e) => Err(map_rusb_error(e)),
        }
    }
}

fn map_rusb_error(error: rusb::Error) -> TransferError {
    match error {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Access => TransferError::Access,
        rusb::Error::NotFound => TransferError::NotFound,
        rusb::Error::Io => TransferError::Io,
        other => TransferError::Other(other.to_string()),
    }
}

/// Stable bus id for a device: bus number plus the port chain down to
/// the device, `.`-separated (e.g. `1-4.3`); `{bus}-0` when the port
/// chain is unavailable (root devices on some platforms)
fn bus_id_of(device: &Device<Context>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{}-{}", device.bus_number(), path.join("."))
        }
        _ => format!("{}-0", device.bus_number()),
    }
}

fn find_device(context: &Context, bus_id: &str) -> rusb::Result<Option<Device<Context>>> {
    Ok(context
        .devices()?
        .iter()
        .find(|device| bus_id_of(device) == bus_id))
}

/// Take an immutable snapshot of one device's descriptors
fn snapshot_device(device: &Device<Context>) -> rusb::Result<DeviceSnapshot> {
    let descriptor = device.device_descriptor()?;
    let busid = bus_id_of(device);

    let mut interfaces = Vec::new();
    let mut endpoints = Vec::new();
    let mut configuration_value = 0;
    if let Ok(config) = device.active_config_descriptor() {
        configuration_value = config.number();
        for interface in config.interfaces() {
            // First alternate setting describes the interface at rest
            if let Some(desc) = interface.descriptors().next() {
                interfaces.push(InterfaceRecord {
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                });
                for endpoint in desc.endpoint_descriptors() {
                    endpoints.push(EndpointDescriptor {
                        address: endpoint.address(),
                        kind: map_transfer_kind(endpoint.transfer_type()),
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.interval(),
                    });
                }
            }
        }
    }

    let (manufacturer, product, serial_number) = read_string_descriptors(device, &descriptor);

    let record = DeviceRecord {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid: busid.clone(),
        busnum: device.bus_number() as u32,
        devnum: device.address() as u32,
        speed: map_device_speed(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: bcd_of(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value,
        num_configurations: descriptor.num_configurations(),
        num_interfaces: interfaces.len() as u8,
        interfaces,
    };

    Ok(DeviceSnapshot {
        record,
        manufacturer,
        product,
        serial_number,
        endpoints,
    })
}

/// Read the string descriptors, tolerating devices that cannot be
/// opened or that return garbage
fn read_string_descriptors(
    device: &Device<Context>,
    descriptor: &rusb::DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let handle = match device.open() {
        Ok(handle) => handle,
        Err(_) => return (None, None, None),
    };

    let read = |index: Option<u8>| {
        index
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .map(|s| clean_usb_string(&s))
            .filter(|s| !s.is_empty())
    };

    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

/// Truncate at the first NUL; some devices pad their strings with NULs
/// followed by stale buffer contents
fn clean_usb_string(value: &str) -> String {
    match value.find('\0') {
        Some(pos) => value[..pos].to_string(),
        None => value.to_string(),
    }
}

fn map_transfer_kind(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn bcd_of(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8)
        | ((version.minor() as u16 & 0x0f) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}
