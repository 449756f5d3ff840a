//! Device table (C1): process-wide registry of live devices keyed by
//! `(bus, address)`, with mark-and-sweep liveness (spec.md §4.1).

use crate::device::{AliveState, Device, DeviceLocation};
use std::collections::HashMap;

#[derive(Default)]
pub struct DeviceTable {
    devices: HashMap<DeviceLocation, Device>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: Device) {
        self.devices.insert(device.location, device);
    }

    pub fn get(&self, location: DeviceLocation) -> Option<&Device> {
        self.devices.get(&location)
    }

    pub fn get_mut(&mut self, location: DeviceLocation) -> Option<&mut Device> {
        self.devices.get_mut(&location)
    }

    pub fn contains(&self, location: DeviceLocation) -> bool {
        self.devices.contains_key(&location)
    }

    pub fn remove(&mut self, location: DeviceLocation) -> Option<Device> {
        self.devices.remove(&location)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Start of a rediscovery scan: clear every record's alive flag to
    /// `Provisional` (spec.md §4.1). Devices already `Doomed` stay doomed —
    /// liveness never moves backward out of that state within a lifecycle.
    pub fn begin_scan(&mut self) {
        for dev in self.devices.values_mut() {
            if dev.alive != AliveState::Doomed {
                dev.alive = AliveState::Provisional;
            }
        }
    }

    /// Re-observing an existing key during a scan marks it live again.
    pub fn mark_seen(&mut self, location: DeviceLocation) {
        if let Some(dev) = self.devices.get_mut(&location) {
            if dev.alive != AliveState::Doomed {
                dev.alive = AliveState::Live;
            }
        }
    }

    /// End of a scan: any survivor still `Provisional` (i.e. never
    /// re-marked live) is doomed. Returns the locations that were doomed by
    /// this call, for the reaper to act on.
    pub fn sweep_unseen(&mut self) -> Vec<DeviceLocation> {
        let mut doomed = Vec::new();
        for dev in self.devices.values_mut() {
            if dev.alive == AliveState::Provisional {
                dev.doom();
                doomed.push(dev.location);
            }
        }
        doomed
    }

    /// Locations of every device currently doomed (used by the reaper,
    /// which doesn't care whether doom came from a callback error, a
    /// hotplug departure, or a failed sweep).
    pub fn doomed_locations(&self) -> Vec<DeviceLocation> {
        self.devices
            .values()
            .filter(|d| d.is_doomed())
            .map(|d| d.location)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;
    use crate::ffi::RawDeviceHandle;

    fn fake_device(bus: u8, address: u8) -> Device {
        let descriptor = DeviceDescriptor {
            vendor_id: crate::constants::VID_APPLE,
            product_id: crate::constants::PID_RANGE_LOW,
            bcd_device: 0,
            num_configurations: 4,
            serial_index: 3,
        };
        Device::new(
            DeviceLocation::new(bus, address),
            descriptor,
            unsafe { RawDeviceHandle::dangling_for_tests() },
        )
    }

    #[test]
    fn insert_and_lookup_round_trip() {
        let mut table = DeviceTable::new();
        let loc = DeviceLocation::new(1, 2);
        table.insert(fake_device(1, 2));
        assert!(table.contains(loc));
        assert_eq!(table.get(loc).unwrap().location, loc);
    }

    #[test]
    fn mark_and_sweep_reaps_devices_not_re_observed() {
        let mut table = DeviceTable::new();
        let stays = DeviceLocation::new(1, 1);
        let goes = DeviceLocation::new(1, 2);
        table.insert(fake_device(1, 1));
        table.insert(fake_device(1, 2));

        // First scan: both observed, both live.
        table.begin_scan();
        table.mark_seen(stays);
        table.mark_seen(goes);
        assert!(table.sweep_unseen().is_empty());

        // Second scan: only `stays` is re-observed.
        table.begin_scan();
        table.mark_seen(stays);
        let doomed = table.sweep_unseen();

        assert_eq!(doomed, vec![goes]);
        assert!(table.get(stays).unwrap().alive == AliveState::Live);
        assert!(table.get(goes).unwrap().is_doomed());
    }

    #[test]
    fn sweep_never_touches_other_devices() {
        let mut table = DeviceTable::new();
        let a = DeviceLocation::new(2, 1);
        let b = DeviceLocation::new(2, 2);
        table.insert(fake_device(2, 1));
        table.insert(fake_device(2, 2));
        table.begin_scan();
        table.mark_seen(a);
        table.mark_seen(b);
        table.sweep_unseen();

        // New scan where the device list is missing `b` only.
        table.begin_scan();
        table.mark_seen(a);
        let doomed = table.sweep_unseen();
        assert_eq!(doomed, vec![b]);
        assert!(!table.get(a).unwrap().is_doomed());
    }

    #[test]
    fn doomed_devices_never_resurrect() {
        let mut table = DeviceTable::new();
        let loc = DeviceLocation::new(3, 1);
        table.insert(fake_device(3, 1));
        table.get_mut(loc).unwrap().doom();

        table.begin_scan();
        table.mark_seen(loc);
        assert!(table.get(loc).unwrap().is_doomed());
    }
}
