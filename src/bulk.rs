//! Bulk I/O engine (C7): N parallel read loops, write submission with
//! automatic zero-length-packet flush (spec.md §4.7).

use crate::constants::{NUM_RX_LOOPS, USB_MRU};

/// Whether a write of `len` bytes needs a trailing zero-length packet to
/// terminate the bulk frame. Restricted to `len > 0` — spec.md's
/// restriction over the original's `length % wMaxPacketSize == 0` (which
/// also fires at `length == 0`, treated here as a divergence from
/// 30-year-old C rather than intended behavior; see SPEC_FULL.md §9).
pub fn needs_zlp(len: usize, max_packet_size: u16) -> bool {
    max_packet_size != 0 && len > 0 && len % max_packet_size as usize == 0
}

/// Fixed read-buffer size for every rx transfer (spec.md §3 "MRU").
pub fn read_buffer_size() -> usize {
    USB_MRU
}

/// How many of the `NUM_RX_LOOPS` submissions must succeed for the device
/// to be usable at all (spec.md §4.7: "if zero of N submissions succeed,
/// the device is fatally failed").
pub fn min_required_rx_loops() -> usize {
    1
}

pub fn target_rx_loops() -> usize {
    NUM_RX_LOOPS
}

/// Outcome of attempting to start the rx loops for a device, classifying
/// the tolerance spec.md §4.7 and §9 describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStartupOutcome {
    /// All `NUM_RX_LOOPS` submissions succeeded.
    Full,
    /// Between 1 and `NUM_RX_LOOPS - 1` succeeded; usable but degraded.
    Partial(usize),
    /// Zero succeeded; fatal to this device.
    Fatal,
}

pub fn classify_rx_startup(succeeded: usize) -> RxStartupOutcome {
    if succeeded == 0 {
        RxStartupOutcome::Fatal
    } else if succeeded >= target_rx_loops() {
        RxStartupOutcome::Full
    } else {
        RxStartupOutcome::Partial(succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlp_not_sent_for_zero_length_write() {
        assert!(!needs_zlp(0, 64));
    }

    #[test]
    fn zlp_sent_when_length_is_exact_multiple_of_max_packet_size() {
        assert!(needs_zlp(64, 64));
        assert!(needs_zlp(128, 64));
    }

    #[test]
    fn zlp_not_sent_one_byte_past_a_multiple() {
        assert!(!needs_zlp(65, 64));
    }

    #[test]
    fn zlp_not_sent_one_byte_short_of_a_multiple() {
        assert!(!needs_zlp(63, 64));
    }

    #[test]
    fn rx_startup_classification_matches_spec_tolerance() {
        assert_eq!(classify_rx_startup(0), RxStartupOutcome::Fatal);
        assert_eq!(classify_rx_startup(1), RxStartupOutcome::Partial(1));
        assert_eq!(classify_rx_startup(2), RxStartupOutcome::Partial(2));
        assert_eq!(classify_rx_startup(NUM_RX_LOOPS), RxStartupOutcome::Full);
    }
}
