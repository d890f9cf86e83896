//! Deterministic device backend for tests
//!
//! Implements the same capability traits as the hardware backend but is
//! driven entirely by scripted responses, so protocol-engine behavior
//! (ordering, cancellation, error paths) can be tested without a USB
//! stack. Transfers complete synchronously in submission order unless an
//! endpoint is scripted to hold, in which case the transfer stays in
//! flight until the session cancels it.

use super::backend::{DeviceClaim, UsbBackend};
use bytes::Bytes;
use common::usb_types::{
    ClaimError, DeviceSnapshot, InFlightTransfer, TransferCompleter, TransferOutcome,
    TransferRequest, TransferResult, transfer_pair,
};
use protocol::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// What the mock does with the next transfer on an endpoint
#[derive(Debug, Clone)]
enum Script {
    /// Complete with this result
    Respond(TransferResult),
    /// Never complete; the transfer stays pending until cancelled
    Hold,
}

#[derive(Default)]
struct MockState {
    devices: HashMap<String, DeviceSnapshot>,
    deny_claim: HashSet<String>,
    claimed: HashSet<String>,
    /// Scripted replies per (bus id, endpoint address)
    scripts: HashMap<(String, u8), VecDeque<Script>>,
    /// Completers of held transfers, kept alive for inspection
    held: Vec<TransferCompleter>,
}

/// Scriptable in-memory backend
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, snapshot: DeviceSnapshot) {
        let mut state = self.lock();
        state.devices.insert(snapshot.busid().to_string(), snapshot);
    }

    /// Make claims on this bus id fail with `PermissionDenied`
    pub fn deny_claim(&self, bus_id: &str) {
        self.lock().deny_claim.insert(bus_id.to_string());
    }

    /// Queue a reply for the next transfer on an endpoint address
    pub fn script(&self, bus_id: &str, address: u8, result: TransferResult) {
        self.lock()
            .scripts
            .entry((bus_id.to_string(), address))
            .or_default()
            .push_back(Script::Respond(result));
    }

    /// Queue a transfer that never completes on its own
    pub fn script_hold(&self, bus_id: &str, address: u8) {
        self.lock()
            .scripts
            .entry((bus_id.to_string(), address))
            .or_default()
            .push_back(Script::Hold);
    }

    /// Whether the device is currently claimed
    pub fn is_claimed(&self, bus_id: &str) -> bool {
        self.lock().claimed.contains(bus_id)
    }

    /// Number of transfers held in flight so far
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Number of held transfers that have been flagged for cancellation
    pub fn held_cancelled_count(&self) -> usize {
        self.lock().held.iter().filter(|c| c.is_cancelled()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UsbBackend for MockBackend {
    type Claim = MockClaim;

    fn devices(&self) -> common::Result<Vec<DeviceSnapshot>> {
        let mut devices: Vec<_> = self.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.busid().cmp(b.busid()));
        Ok(devices)
    }

    fn claim(&self, bus_id: &str) -> Result<Self::Claim, ClaimError> {
        let mut state = self.lock();

        let snapshot = state
            .devices
            .get(bus_id)
            .cloned()
            .ok_or_else(|| ClaimError::NotFound(bus_id.to_string()))?;

        if state.deny_claim.contains(bus_id) {
            return Err(ClaimError::PermissionDenied(bus_id.to_string()));
        }
        if !state.claimed.insert(bus_id.to_string()) {
            return Err(ClaimError::AlreadyClaimed(bus_id.to_string()));
        }

        Ok(MockClaim {
            state: self.state.clone(),
            snapshot,
        })
    }
}

/// Claim handed out by [`MockBackend`]
pub struct MockClaim {
    state: Arc<Mutex<MockState>>,
    snapshot: DeviceSnapshot,
}

impl DeviceClaim for MockClaim {
    fn snapshot(&self) -> &DeviceSnapshot {
        &self.snapshot
    }

    fn submit(&self, request: TransferRequest) -> InFlightTransfer {
        let (completer, inflight) = transfer_pair();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (self.snapshot.busid().to_string(), request.address());
        let script = state.scripts.get_mut(&key).and_then(VecDeque::pop_front);

        match script {
            Some(Script::Respond(result)) => {
                completer.complete(result);
            }
            Some(Script::Hold) => {
                state.held.push(completer);
            }
            None => {
                // Unscripted endpoints succeed blandly: IN transfers
                // yield a zeroed buffer of the requested length, OUT
                // transfers swallow their payload.
                let outcome = match request.direction {
                    Direction::In => {
                        TransferOutcome::received(Bytes::from(vec![0u8; request.length]))
                    }
                    Direction::Out => TransferOutcome::written(request.payload.len()),
                };
                completer.complete(Ok(outcome));
            }
        }

        inflight
    }
}

impl Drop for MockClaim {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .claimed
            .remove(self.snapshot.busid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::sample_snapshot;
    use common::usb_types::{TransferError, TransferKind};

    fn in_request(endpoint: u8, length: usize) -> TransferRequest {
        TransferRequest {
            endpoint,
            direction: Direction::In,
            kind: TransferKind::Interrupt,
            length,
            setup: [0u8; 8],
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_claim_lifecycle() {
        let backend = MockBackend::new();
        backend.add_device(sample_snapshot("1-4"));

        let claim = backend.claim("1-4").unwrap();
        assert!(backend.is_claimed("1-4"));
        assert!(matches!(
            backend.claim("1-4"),
            Err(ClaimError::AlreadyClaimed(_))
        ));

        drop(claim);
        assert!(!backend.is_claimed("1-4"));
        assert!(backend.claim("1-4").is_ok());
    }

    #[test]
    fn test_claim_errors() {
        let backend = MockBackend::new();
        backend.add_device(sample_snapshot("2-1"));
        backend.deny_claim("2-1");

        assert!(matches!(
            backend.claim("9-9"),
            Err(ClaimError::NotFound(_))
        ));
        assert!(matches!(
            backend.claim("2-1"),
            Err(ClaimError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_reply() {
        let backend = MockBackend::new();
        backend.add_device(sample_snapshot("1-4"));
        backend.script(
            "1-4",
            0x81,
            Ok(TransferOutcome::received(Bytes::from_static(&[1, 2, 3]))),
        );
        backend.script("1-4", 0x81, Err(TransferError::Stall));

        let claim = backend.claim("1-4").unwrap();

        let first = claim.submit(in_request(1, 8)).complete().await.unwrap();
        assert_eq!(first.data.as_ref(), &[1, 2, 3]);

        let second = claim.submit(in_request(1, 8)).complete().await;
        assert_eq!(second, Err(TransferError::Stall));

        // Script exhausted; the default takes over
        let third = claim.submit(in_request(1, 8)).complete().await.unwrap();
        assert_eq!(third.actual_length, 8);
    }

    #[tokio::test]
    async fn test_held_transfer_waits_for_cancel() {
        let backend = MockBackend::new();
        backend.add_device(sample_snapshot("1-4"));
        backend.script_hold("1-4", 0x81);

        let claim = backend.claim("1-4").unwrap();
        let inflight = claim.submit(in_request(1, 8));
        assert_eq!(backend.held_count(), 1);
        assert_eq!(backend.held_cancelled_count(), 0);

        assert!(inflight.cancel_handle().cancel());
        assert_eq!(backend.held_cancelled_count(), 1);
        assert_eq!(
            inflight.complete().await,
            Err(TransferError::Cancelled)
        );
    }
}
