//! The per-device record (spec.md §3) and its state machine (§4.10).

use std::time::Duration;

/// `(bus_number, device_address)` — unique while a device stays plugged in.
/// This is the device table's key (C1) and the value the collaborator sees
/// as a device identity across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
}

impl DeviceLocation {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }

    /// `(bus << 16) | address`, spec.md §6/§8 property 4.
    pub fn as_u32(self) -> u32 {
        ((self.bus as u32) << 16) | self.address as u32
    }
}

/// Cached copy of the fields of `libusb_device_descriptor` this crate
/// actually needs, read out once at open time (§3 "device descriptor").
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub num_configurations: u8,
    pub serial_index: u8,
}

/// Bits/second, derived from the libusb speed class (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl LinkSpeed {
    /// Matches `libusb_speed` as reported by `libusb_get_device_speed`;
    /// unknown speed classes are treated as high speed (§3's table).
    pub fn from_libusb_speed(speed: i32) -> Self {
        use libusb1_sys::constants::*;
        match speed {
            LIBUSB_SPEED_LOW => LinkSpeed::Low,
            LIBUSB_SPEED_FULL => LinkSpeed::Full,
            LIBUSB_SPEED_SUPER => LinkSpeed::Super,
            LIBUSB_SPEED_SUPER_PLUS => LinkSpeed::SuperPlus,
            LIBUSB_SPEED_HIGH | _ => LinkSpeed::High,
        }
    }

    pub fn bits_per_second(self) -> u64 {
        match self {
            LinkSpeed::Low => 1_500_000,
            LinkSpeed::Full => 12_000_000,
            LinkSpeed::High => 480_000_000,
            LinkSpeed::Super => 5_000_000_000,
            LinkSpeed::SuperPlus => 10_000_000_000,
        }
    }
}

/// Tri-state liveness (§3 "alive flag"). Transitions are monotonic toward
/// `Doomed` within one lifecycle — nothing ever resurrects a doomed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveState {
    Provisional,
    Live,
    Doomed,
}

/// Per-device state machine (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Provisional,
    ProbingMode,
    SwitchingMode,
    Configuring,
    ReadingSerial,
    Live,
    Doomed,
    Gone,
}

impl DeviceState {
    /// Whether this state still counts as "in the table, not yet reaped".
    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceState::Gone)
    }
}

/// Chosen interface + endpoints, populated by the configuration selector
/// (C5). `None` until selection succeeds (§3 invariant).
#[derive(Debug, Clone, Copy)]
pub struct InterfaceSelection {
    pub interface_number: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub max_packet_size: u16,
}

/// The live device record (§3). Owned by the device table (C1); transfers
/// refer to it only by `DeviceLocation`, never by pointer (§9 design note).
pub struct Device {
    pub location: DeviceLocation,
    pub descriptor: DeviceDescriptor,
    pub selection: Option<InterfaceSelection>,
    pub speed: LinkSpeed,
    pub serial: Option<String>,
    pub alive: AliveState,
    pub state: DeviceState,
    pub rx_transfers: std::collections::HashSet<crate::transfers::TransferId>,
    pub tx_transfers: std::collections::HashSet<crate::transfers::TransferId>,
    /// Raw libusb device handle. `None` once the device has been closed;
    /// realizes §3's "non-null iff the record is alive" as a Rust `Option`.
    pub(crate) handle: Option<crate::ffi::RawDeviceHandle>,
}

impl Device {
    pub fn new(
        location: DeviceLocation,
        descriptor: DeviceDescriptor,
        handle: crate::ffi::RawDeviceHandle,
    ) -> Self {
        Self {
            location,
            descriptor,
            selection: None,
            speed: LinkSpeed::High,
            serial: None,
            alive: AliveState::Provisional,
            state: DeviceState::Provisional,
            rx_transfers: Default::default(),
            tx_transfers: Default::default(),
            handle: Some(handle),
        }
    }

    pub fn is_doomed(&self) -> bool {
        self.alive == AliveState::Doomed
    }

    pub fn doom(&mut self) {
        // Monotonic: once doomed, stays doomed.
        self.alive = AliveState::Doomed;
        self.state = DeviceState::Doomed;
    }

    pub fn outstanding_transfers(&self) -> usize {
        self.rx_transfers.len() + self.tx_transfers.len()
    }
}

/// Snapshot handed to the collaborator's `device_add`, so the caller never
/// has to reach back into crate-private device-table state.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub location: DeviceLocation,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub speed_bps: u64,
}

impl From<&Device> for DeviceInfo {
    fn from(d: &Device) -> Self {
        DeviceInfo {
            location: d.location,
            vendor_id: d.descriptor.vendor_id,
            product_id: d.descriptor.product_id,
            serial: d.serial.clone().unwrap_or_default(),
            speed_bps: d.speed.bits_per_second(),
        }
    }
}

/// Drain bound used by the reaper while waiting for cancellations to land.
pub const DRAIN_BOUND: Duration = crate::constants::DISCONNECT_DRAIN_BOUND;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_packs_bus_and_address() {
        let loc = DeviceLocation::new(0x03, 0x07);
        assert_eq!(loc.as_u32(), (3u32 << 16) | 7);
    }

    #[test]
    fn unknown_speed_is_treated_as_high() {
        // LIBUSB_SPEED_UNKNOWN is 0 in libusb1-sys; any other unrecognized
        // value should fall into the same "assume high speed" bucket.
        assert_eq!(LinkSpeed::from_libusb_speed(0), LinkSpeed::High);
        assert_eq!(LinkSpeed::from_libusb_speed(9999), LinkSpeed::High);
    }

    #[test]
    fn speed_bits_per_second_table() {
        assert_eq!(LinkSpeed::Low.bits_per_second(), 1_500_000);
        assert_eq!(LinkSpeed::Full.bits_per_second(), 12_000_000);
        assert_eq!(LinkSpeed::High.bits_per_second(), 480_000_000);
        assert_eq!(LinkSpeed::Super.bits_per_second(), 5_000_000_000);
        assert_eq!(LinkSpeed::SuperPlus.bits_per_second(), 10_000_000_000);
    }
}
