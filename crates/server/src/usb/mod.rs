//! USB subsystem
//!
//! Device access for the protocol engine: the capability traits it is
//! written against, the libusb-backed implementation, the deterministic
//! test double, and the process-wide claim table that keeps two
//! sessions from attaching the same device.

pub mod backend;
pub mod claims;
pub mod host;
pub mod mock;

pub use backend::{DeviceClaim, UsbBackend};
pub use claims::{ClaimSlot, ClaimTable};
pub use host::RusbBackend;
pub use mock::MockBackend;
