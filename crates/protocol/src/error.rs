//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding USB/IP messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes available than the fixed header layout requires
    #[error("truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Version field does not match the protocol version we speak
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),

    /// Unrecognized operation code in a handshake header
    #[error("unknown operation code {0:#06x}")]
    UnknownOpCode(u16),

    /// Unrecognized command in a URB header
    #[error("unknown URB command {0:#010x}")]
    UnknownUrbCommand(u32),

    /// Direction field is neither OUT (0) nor IN (1)
    #[error("invalid transfer direction {0}")]
    InvalidDirection(u32),

    /// Transfer buffer length exceeds the sanity limit
    #[error("transfer too large: {len} bytes (max {max})")]
    TransferTooLarge { len: usize, max: usize },

    /// I/O error while reading or writing a message
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
