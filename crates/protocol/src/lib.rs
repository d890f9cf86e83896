//! USB/IP wire protocol
//!
//! This crate implements the binary protocol spoken between a USB/IP
//! client (e.g. the Linux `vhci_hcd` driver and the `usbip` tool) and an
//! exporting server. The protocol is documented in the Linux kernel:
//! drivers/usb/usbip/usbip_common.h
//!
//! # Protocol Overview
//!
//! USB/IP runs over a plain TCP connection (default port 3240):
//! - All integers are big-endian (network byte order)
//! - String fields are fixed-width and null-padded
//! - A fresh connection starts with a one-shot handshake exchange
//!   ([`op`]): device listing or device import
//! - After a successful import the same connection carries URB traffic
//!   ([`urb`]): 48-byte headers with optional payload
//!
//! # Example
//!
//! ```
//! use protocol::op::OpReqImport;
//!
//! let request = OpReqImport { busid: "1-4".to_string() };
//! let bytes = request.to_bytes().unwrap();
//! assert_eq!(bytes.len(), OpReqImport::SIZE);
//! ```

pub mod codec;
pub mod error;
pub mod op;
pub mod types;
pub mod urb;

pub use codec::{MAX_TRANSFER_LEN, read_fixed_str, write_fixed_str};
#[cfg(feature = "async")]
pub use codec::{read_op_request, read_urb_request};
pub use error::{ProtocolError, Result};
pub use op::{
    OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpHeader, OpRepDevlist,
    OpRepImport, OpReqDevlist, OpReqImport, OpRequest, USBIP_PORT, USBIP_VERSION,
};
pub use types::{
    BUS_ID_LEN, DeviceRecord, DeviceSpeed, Direction, InterfaceRecord, OpStatus, SYSFS_PATH_LEN,
};
pub use urb::{
    CmdSubmit, CmdUnlink, RetSubmit, RetUnlink, USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK,
    USBIP_RET_SUBMIT, USBIP_RET_UNLINK, UrbRequest,
};
