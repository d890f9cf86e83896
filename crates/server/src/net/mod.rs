//! Network subsystem
//!
//! The USB/IP protocol engine: TCP listener, per-connection handshake,
//! and the long-lived URB session an import turns into.
//!
//! ```text
//! UsbIpServer
//!   ├─> accept connections
//!   └─> spawn handshake per client
//!         ├─> OP_REQ_DEVLIST: reply and close
//!         └─> OP_REQ_IMPORT: claim device, become a Session
//!               ├─> CMD_SUBMIT -> device transfer -> RET_SUBMIT
//!               ├─> CMD_UNLINK -> cancel pending -> RET_UNLINK
//!               └─> disconnect: cancel all, release claim
//! ```

pub mod handshake;
pub mod server;
pub mod session;

pub use handshake::ExportContext;
pub use server::UsbIpServer;
pub use session::Session;
