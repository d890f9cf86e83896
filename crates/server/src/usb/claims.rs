//! Process-wide device claim table
//!
//! The one piece of state sessions share: which bus ids are currently
//! attached to a session. Acquisition is atomic and hands back an RAII
//! slot, so a claim can never outlive its session however the session
//! ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Table of bus ids currently claimed by a session
#[derive(Debug, Clone, Default)]
pub struct ClaimTable {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a bus id
    ///
    /// Returns `None` when another session already holds it. The slot
    /// frees the bus id on drop.
    pub fn acquire(&self, bus_id: &str) -> Option<ClaimSlot> {
        let mut claimed = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(bus_id.to_string()) {
            return None;
        }

        debug!("claimed {}", bus_id);
        Some(ClaimSlot {
            table: self.inner.clone(),
            bus_id: bus_id.to_string(),
        })
    }

    pub fn is_claimed(&self, bus_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(bus_id)
    }
}

/// RAII reservation of one bus id in the [`ClaimTable`]
#[derive(Debug)]
pub struct ClaimSlot {
    table: Arc<Mutex<HashSet<String>>>,
    bus_id: String,
}

impl ClaimSlot {
    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }
}

impl Drop for ClaimSlot {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.bus_id);
        debug!("released {}", self.bus_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails() {
        let table = ClaimTable::new();
        let slot = table.acquire("1-4").unwrap();
        assert!(table.acquire("1-4").is_none());
        assert!(table.is_claimed("1-4"));
        drop(slot);
        assert!(!table.is_claimed("1-4"));
    }

    #[test]
    fn test_reacquire_after_release() {
        let table = ClaimTable::new();
        drop(table.acquire("1-4").unwrap());
        assert!(table.acquire("1-4").is_some());
    }

    #[test]
    fn test_distinct_bus_ids_are_independent() {
        let table = ClaimTable::new();
        let _a = table.acquire("1-4").unwrap();
        let _b = table.acquire("2-1").unwrap();
        assert!(table.is_claimed("1-4"));
        assert!(table.is_claimed("2-1"));
    }
}
