//! USB type abstractions shared by the protocol engine and device backends
//!
//! A backend exposes devices as [`DeviceSnapshot`]s (immutable
//! enumeration-time descriptions) and executes URBs as transfers. The
//! transfer handshake is split in two halves: the backend keeps a
//! [`TransferCompleter`] and delivers the outcome whenever its I/O
//! finishes, the protocol engine keeps the [`InFlightTransfer`] and
//! awaits it. A [`CancelHandle`] cloned off the in-flight half races the
//! completer over an atomic tri-state, so exactly one of "completed" and
//! "cancelled" wins, deterministically.

use bytes::Bytes;
use protocol::{DeviceRecord, Direction};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

/// Endpoint transfer kinds, from the descriptor's bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of the device's active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit (e.g. 0x81)
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Immutable snapshot of one exportable device, taken at enumeration time
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Wire-level device block, interface entries included
    pub record: DeviceRecord,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Endpoints of the active configuration; the default control
    /// endpoint is implicit and not listed
    pub endpoints: Vec<EndpointDescriptor>,
}

impl DeviceSnapshot {
    pub fn busid(&self) -> &str {
        &self.record.busid
    }

    /// Device id as the wire carries it: busnum in the high half,
    /// devnum in the low half
    pub fn devid(&self) -> u32 {
        (self.record.busnum << 16) | (self.record.devnum & 0xffff)
    }

    /// Look up an endpoint by number and direction
    ///
    /// Endpoint 0 is the bidirectional control endpoint every device
    /// has; it is always found.
    pub fn endpoint(&self, number: u8, direction: Direction) -> Option<EndpointDescriptor> {
        if number == 0 {
            return Some(EndpointDescriptor {
                address: match direction {
                    Direction::In => 0x80,
                    Direction::Out => 0x00,
                },
                kind: TransferKind::Control,
                max_packet_size: 64,
                interval: 0,
            });
        }

        self.endpoints
            .iter()
            .copied()
            .find(|ep| ep.number() == number && ep.direction() == direction)
    }
}

/// Failure to take exclusive ownership of a device
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("no device with bus id {0}")]
    NotFound(String),

    #[error("device {0} is already claimed")]
    AlreadyClaimed(String),

    #[error("not allowed to claim device {0}")]
    PermissionDenied(String),

    #[error("claim failed: {0}")]
    Other(String),
}

/// A failed transfer, as reported in `RET_SUBMIT`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device is gone")]
    NoDevice,

    #[error("invalid transfer parameters")]
    InvalidParam,

    #[error("device is busy")]
    Busy,

    #[error("buffer overflow")]
    Overflow,

    #[error("access denied")]
    Access,

    #[error("no such resource")]
    NotFound,

    #[error("transfer cancelled before completion")]
    Cancelled,

    #[error("device I/O error")]
    Io,

    #[error("transfer failed: {0}")]
    Other(String),
}

impl TransferError {
    /// Map to the negative errno value carried in the wire status field
    pub fn errno(&self) -> i32 {
        match self {
            Self::Timeout => -110,       // ETIMEDOUT
            Self::Stall => -32,          // EPIPE
            Self::NoDevice => -19,       // ENODEV
            Self::InvalidParam => -22,   // EINVAL
            Self::Busy => -16,           // EBUSY
            Self::Overflow => -75,       // EOVERFLOW
            Self::Access => -13,         // EACCES
            Self::NotFound => -2,        // ENOENT
            Self::Cancelled => -104,     // ECONNRESET
            Self::Io | Self::Other(_) => -5, // EIO
        }
    }
}

/// A transfer as the session hands it to the device layer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Endpoint number without the direction bit
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Requested length: IN buffer size, or OUT payload size
    pub length: usize,
    /// Setup packet; meaningful for control transfers only
    pub setup: [u8; 8],
    /// OUT data; empty for IN requests
    pub payload: Bytes,
}

impl TransferRequest {
    /// Endpoint address with the direction bit set for IN
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint,
        }
    }
}

/// A successfully completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes actually moved (received for IN, written for OUT)
    pub actual_length: u32,
    /// Received data for IN transfers, empty for OUT
    pub data: Bytes,
}

impl TransferOutcome {
    pub fn received(data: Bytes) -> Self {
        Self {
            actual_length: data.len() as u32,
            data,
        }
    }

    pub fn written(len: usize) -> Self {
        Self {
            actual_length: len as u32,
            data: Bytes::new(),
        }
    }
}

pub type TransferResult = std::result::Result<TransferOutcome, TransferError>;

const STATE_PENDING: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Create a linked completer/in-flight pair for one transfer
pub fn transfer_pair() -> (TransferCompleter, InFlightTransfer) {
    let state = Arc::new(AtomicU8::new(STATE_PENDING));
    let notify = Arc::new(Notify::new());
    let (tx, rx) = oneshot::channel();
    (
        TransferCompleter {
            state: state.clone(),
            tx,
        },
        InFlightTransfer { state, notify, rx },
    )
}

/// Backend-side half: delivers the outcome of one transfer
#[derive(Debug)]
pub struct TransferCompleter {
    state: Arc<AtomicU8>,
    tx: oneshot::Sender<TransferResult>,
}

impl TransferCompleter {
    /// Deliver the outcome, unless a cancellation won the race first.
    /// Returns false when the result was discarded.
    pub fn complete(self, result: TransferResult) -> bool {
        let won = self
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_COMPLETED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            // Receiver may already be gone if the session died; that is
            // not this side's problem.
            let _ = self.tx.send(result);
        }
        won
    }

    /// Whether the transfer was flagged for cancellation; lets a backend
    /// skip work it has not started yet.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }
}

/// Session-side half: awaits the outcome of one transfer
#[derive(Debug)]
pub struct InFlightTransfer {
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
    rx: oneshot::Receiver<TransferResult>,
}

impl InFlightTransfer {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Wait for the device layer to finish
    ///
    /// Resolves to `Err(Cancelled)` when a cancellation beat the
    /// completion (even one the backend cannot observe, e.g. while it is
    /// stuck in blocking I/O), or when the backend dropped its half.
    pub async fn complete(mut self) -> TransferResult {
        tokio::select! {
            result = &mut self.rx => match result {
                Ok(result) => result,
                Err(_) => Err(TransferError::Cancelled),
            },
            _ = self.notify.notified() => Err(TransferError::Cancelled),
        }
    }
}

/// Flags one in-flight transfer for cancellation
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Returns true iff this call flagged the transfer before its
    /// natural completion.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            // Wake the waiter stuck on a transfer that will never
            // finish; notify_one stores a permit, so it also covers a
            // waiter that has not started waiting yet
            self.notify.notify_one();
        }
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_endpoints() -> DeviceSnapshot {
        crate::test_utils::sample_snapshot("1-4")
    }

    #[test]
    fn test_endpoint_zero_always_present() {
        let snapshot = snapshot_with_endpoints();
        let ep_out = snapshot.endpoint(0, Direction::Out).unwrap();
        let ep_in = snapshot.endpoint(0, Direction::In).unwrap();
        assert_eq!(ep_out.kind, TransferKind::Control);
        assert_eq!(ep_in.address, 0x80);
    }

    #[test]
    fn test_endpoint_lookup_respects_direction() {
        let snapshot = snapshot_with_endpoints();
        // 0x81 is interrupt IN; there is no interrupt OUT counterpart
        assert!(snapshot.endpoint(1, Direction::In).is_some());
        assert!(snapshot.endpoint(1, Direction::Out).is_none());
        assert!(snapshot.endpoint(9, Direction::In).is_none());
    }

    #[test]
    fn test_devid_packs_bus_and_device_number() {
        let snapshot = snapshot_with_endpoints();
        assert_eq!(
            snapshot.devid(),
            (snapshot.record.busnum << 16) | snapshot.record.devnum
        );
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TransferError::Timeout.errno(), -110);
        assert_eq!(TransferError::Stall.errno(), -32);
        assert_eq!(TransferError::NotFound.errno(), -2);
        assert_eq!(TransferError::Io.errno(), -5);
        assert_eq!(TransferError::Other("x".into()).errno(), -5);
    }

    #[tokio::test]
    async fn test_transfer_completes() {
        let (completer, inflight) = transfer_pair();
        assert!(completer.complete(Ok(TransferOutcome::written(4))));

        let outcome = inflight.complete().await.unwrap();
        assert_eq!(outcome.actual_length, 4);
    }

    #[tokio::test]
    async fn test_cancel_before_completion_wins() {
        let (completer, inflight) = transfer_pair();
        let handle = inflight.cancel_handle();

        assert!(handle.cancel());
        assert!(!completer.complete(Ok(TransferOutcome::written(4))));

        let result = inflight.complete().await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_loses() {
        let (completer, inflight) = transfer_pair();
        let handle = inflight.cancel_handle();

        assert!(completer.complete(Ok(TransferOutcome::written(1))));
        assert!(!handle.cancel());

        assert!(inflight.complete().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_completer_reads_as_cancelled() {
        let (completer, inflight) = transfer_pair();
        drop(completer);
        assert_eq!(inflight.complete().await, Err(TransferError::Cancelled));
    }
}
