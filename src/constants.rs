//! Tunables and wire-level constants, collected in one place so tests can
//! reference them instead of repeating magic numbers (§11.3 of SPEC_FULL.md).

use std::time::Duration;

/// Apple's USB vendor id.
pub const VID_APPLE: u16 = 0x05ac;

/// T2 coprocessor, a single fixed product id.
pub const PID_APPLE_T2_COPROCESSOR: u16 = 0x1338;

/// Apple Silicon DFU/restore product id range.
pub const PID_APPLE_SILICON_RESTORE_LOW: u16 = 0x1281;
pub const PID_APPLE_SILICON_RESTORE_MAX: u16 = 0x1290;

/// General mobile-device (iPhone/iPad/iPod) product id range.
pub const PID_RANGE_LOW: u16 = 0x1290;
pub const PID_RANGE_MAX: u16 = 0x12ff;

/// Returns whether `product_id` is one this manager should ever look at.
pub fn is_apple_mobile_device(vendor_id: u16, product_id: u16) -> bool {
    if vendor_id != VID_APPLE {
        return false;
    }
    product_id == PID_APPLE_T2_COPROCESSOR
        || (PID_APPLE_SILICON_RESTORE_LOW..=PID_APPLE_SILICON_RESTORE_MAX).contains(&product_id)
        || (PID_RANGE_LOW..=PID_RANGE_MAX).contains(&product_id)
}

/// The multiplexer interface's class/subclass/protocol triple.
pub const INTERFACE_CLASS: u8 = 0xff;
pub const INTERFACE_SUBCLASS: u8 = 0xfe;
pub const INTERFACE_PROTOCOL: u8 = 0x02;

/// CDC-NCM communications interface (class 2, subclass 0x0d).
pub const CDC_NCM_CLASS: u8 = 0x02;
pub const CDC_NCM_SUBCLASS: u8 = 0x0d;

/// Valeria's companion interface, seen alongside the multiplexer interface
/// on configuration 5 when screen-recording is active.
pub const VALERIA_SUBCLASS: u8 = 42;
pub const VALERIA_PROTOCOL: u8 = 255;

/// Vendor-specific control requests understood by Apple devices.
pub const APPLE_VEND_SPECIFIC_GET_MODE: u8 = 0x45;
pub const APPLE_VEND_SPECIFIC_SET_MODE: u8 = 0x46;

/// Name of the environment variable selecting the desired mode.
pub const ENV_DEVICE_MODE: &str = "USBMUX_DEVICE_MODE";

/// Default desired mode when the environment variable is absent or invalid.
pub const DEFAULT_DESIRED_MODE: u8 = 1;

/// Maximum receive unit: the fixed bulk-in read buffer size.
pub const USB_MRU: usize = 64 * 1024;

/// Number of parallel bulk-in read loops kept outstanding per device.
pub const NUM_RX_LOOPS: usize = 3;

/// Interval between rediscovery scans when hotplug is unavailable.
pub const DEVICE_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Consecutive device-list failures tolerated before `discover()` is fatal.
pub const MAX_DEVLIST_FAILURES: u32 = 5;

/// Control-transfer timeout. Bulk transfers use no timeout (infinite).
pub const CONTROL_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bound on how long `disconnect()` will pump events waiting for
/// outstanding transfers to drain before force-reclaiming them.
pub const DISCONNECT_DRAIN_BOUND: Duration = Duration::from_millis(100);

/// Step size used while draining during disconnect.
pub const DISCONNECT_DRAIN_STEP: Duration = Duration::from_millis(1);

/// Fallback packet size when libusb cannot report one for an endpoint.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 64;

/// Timeout handed to the host loop when neither libusb nor the rediscovery
/// schedule has a pending deadline — effectively "block", matching the
/// original's `dev_poll_remain_ms` returning 100000 ms in the equivalent
/// case (`usb.c`: "devices will never be polled") rather than a 0 ms
/// timeout that would spin the host loop at 100% CPU.
pub const NO_PENDING_TIMEOUT: Duration = Duration::from_millis(100_000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_pid_ranges_accept_known_devices() {
        assert!(is_apple_mobile_device(VID_APPLE, PID_APPLE_T2_COPROCESSOR));
        assert!(is_apple_mobile_device(VID_APPLE, PID_APPLE_SILICON_RESTORE_LOW));
        assert!(is_apple_mobile_device(VID_APPLE, PID_APPLE_SILICON_RESTORE_MAX));
        assert!(is_apple_mobile_device(VID_APPLE, PID_RANGE_LOW));
        assert!(is_apple_mobile_device(VID_APPLE, PID_RANGE_MAX));
    }

    #[test]
    fn rejects_wrong_vendor_or_out_of_range_product() {
        assert!(!is_apple_mobile_device(0x1234, PID_RANGE_LOW));
        assert!(!is_apple_mobile_device(VID_APPLE, 0x0001));
        assert!(!is_apple_mobile_device(VID_APPLE, PID_RANGE_MAX + 1));
    }
}
