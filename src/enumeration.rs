//! Enumeration & filter (C3): scans host controllers, filters by
//! vendor/product, opens handles (spec.md §4.3).

use crate::constants::is_apple_mobile_device;
use crate::device::DeviceDescriptor;

/// Whether a candidate is one this manager should ever open (spec.md
/// §4.3: "filter by vendor id = Apple and product id in the acceptable
/// ranges"). Pure over already-read descriptor fields.
pub fn is_candidate(descriptor: &DeviceDescriptor) -> bool {
    is_apple_mobile_device(descriptor.vendor_id, descriptor.product_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PID_APPLE_T2_COPROCESSOR, VID_APPLE};

    fn descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id,
            bcd_device: 0,
            num_configurations: 4,
            serial_index: 3,
        }
    }

    #[test]
    fn accepts_apple_vendor_in_known_ranges() {
        assert!(is_candidate(&descriptor(VID_APPLE, PID_APPLE_T2_COPROCESSOR)));
    }

    #[test]
    fn rejects_non_apple_vendor() {
        assert!(!is_candidate(&descriptor(0x046d, 0xc52b)));
    }
}
