//! Transfer registry (C2): tracks which transfers are in flight for which
//! device, so the reaper knows what it's waiting on and nothing is ever
//! freed before its callback has actually run (spec.md §3 invariant 2).

use crate::device::DeviceLocation;
use std::collections::HashMap;

/// Identity of an in-flight transfer — the address of its `libusb_transfer`,
/// never dereferenced as a pointer by this module (spec.md §9: transfers
/// reference devices by key, not pointer, and vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Rx,
    Tx,
    Control,
}

/// Process-wide bookkeeping of outstanding transfers, indexed by device so
/// the reaper can answer "is device X quiescent yet" without walking every
/// transfer in the process.
#[derive(Default)]
pub struct TransferRegistry {
    owners: HashMap<TransferId, (DeviceLocation, TransferKind)>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transfer as submitted. Must be called before the
    /// corresponding `libusb_submit_transfer` succeeds is observed, so a
    /// callback racing in on another thread's event pump can never find an
    /// untracked id (not a concern on this crate's single-threaded model,
    /// but keeps the invariant explicit).
    pub fn insert(&mut self, id: TransferId, owner: DeviceLocation, kind: TransferKind) {
        self.owners.insert(id, (owner, kind));
    }

    /// Removes a transfer from tracking. Called exactly once, from the
    /// completion callback that's about to free it.
    pub fn remove(&mut self, id: TransferId) -> Option<(DeviceLocation, TransferKind)> {
        self.owners.remove(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.owners.contains_key(&id)
    }

    pub fn outstanding_for(&self, location: DeviceLocation) -> Vec<TransferId> {
        self.owners
            .iter()
            .filter(|(_, (loc, _))| *loc == location)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count_for(&self, location: DeviceLocation) -> usize {
        self.owners.values().filter(|(loc, _)| *loc == location).count()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_outstanding_transfers_per_device() {
        let mut reg = TransferRegistry::new();
        let a = DeviceLocation::new(1, 1);
        let b = DeviceLocation::new(1, 2);
        reg.insert(TransferId(1), a, TransferKind::Rx);
        reg.insert(TransferId(2), a, TransferKind::Rx);
        reg.insert(TransferId(3), b, TransferKind::Tx);

        assert_eq!(reg.count_for(a), 2);
        assert_eq!(reg.count_for(b), 1);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn remove_drops_tracking_and_returns_owner() {
        let mut reg = TransferRegistry::new();
        let a = DeviceLocation::new(2, 1);
        reg.insert(TransferId(7), a, TransferKind::Control);

        let (owner, kind) = reg.remove(TransferId(7)).unwrap();
        assert_eq!(owner, a);
        assert_eq!(kind, TransferKind::Control);
        assert!(!reg.contains(TransferId(7)));
        assert!(reg.remove(TransferId(7)).is_none());
    }

    #[test]
    fn outstanding_for_is_empty_once_all_removed() {
        let mut reg = TransferRegistry::new();
        let a = DeviceLocation::new(3, 1);
        reg.insert(TransferId(10), a, TransferKind::Rx);
        reg.insert(TransferId(11), a, TransferKind::Rx);
        reg.remove(TransferId(10));
        reg.remove(TransferId(11));
        assert!(reg.outstanding_for(a).is_empty());
        assert!(reg.is_empty());
    }
}
