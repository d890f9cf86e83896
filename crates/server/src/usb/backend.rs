//! Device capability traits
//!
//! The protocol engine drives devices exclusively through these traits,
//! so it runs unchanged against real hardware ([`super::RusbBackend`])
//! and against the deterministic double used in tests
//! ([`super::MockBackend`]).

use common::usb_types::{ClaimError, DeviceSnapshot, InFlightTransfer, TransferRequest};

/// Access to the host's USB devices
pub trait UsbBackend: Send + Sync + 'static {
    type Claim: DeviceClaim;

    /// Enumerate all devices currently attached to the host
    ///
    /// Each call takes a fresh look at the bus; devices that went idle
    /// since the last call must still show up.
    fn devices(&self) -> common::Result<Vec<DeviceSnapshot>>;

    /// Take exclusive ownership of one device
    ///
    /// A successful claim detaches the device from whatever was driving
    /// it and keeps it until the returned value is dropped.
    fn claim(&self, bus_id: &str) -> Result<Self::Claim, ClaimError>;

    /// Find one device by bus id without claiming it
    fn device(&self, bus_id: &str) -> common::Result<Option<DeviceSnapshot>> {
        Ok(self
            .devices()?
            .into_iter()
            .find(|d| d.busid() == bus_id))
    }
}

/// Exclusive ownership of one claimed device
///
/// Dropping the claim releases the device.
pub trait DeviceClaim: Send + Sync + 'static {
    /// The snapshot taken when the claim was established
    fn snapshot(&self) -> &DeviceSnapshot;

    /// Start one transfer
    ///
    /// Returns immediately; the caller awaits the returned handle for
    /// the outcome and may cancel through it at any point.
    fn submit(&self, request: TransferRequest) -> InFlightTransfer;
}
