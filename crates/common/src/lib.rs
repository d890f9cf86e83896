//! Common utilities for usbipd
//!
//! Shared functionality between the daemon's subsystems: error handling,
//! logging setup, the USB capability types the protocol engine and the
//! device backends communicate through, and test helpers.

pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    CancelHandle, ClaimError, DeviceSnapshot, EndpointDescriptor, InFlightTransfer,
    TransferCompleter, TransferError, TransferKind, TransferOutcome, TransferRequest,
    TransferResult, transfer_pair,
};
