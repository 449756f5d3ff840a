//! Event pump & poller (C8): integrates libusb's fds and timers with the
//! host's event loop, drives periodic rediscovery when hotplug is
//! unavailable (spec.md §4.8).

use crate::constants::{DEVICE_POLL_PERIOD, NO_PENDING_TIMEOUT};
use std::time::{Duration, Instant};

/// A file descriptor the host loop should poll, tagged so a mixed-source
/// loop can tell ours apart from its own (spec.md §6 `get_fds`).
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: i32,
    pub readable: bool,
    pub writable: bool,
    pub source: PollSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSource {
    Usb,
}

impl From<crate::ffi::context::PollFd> for PollFd {
    fn from(p: crate::ffi::context::PollFd) -> Self {
        PollFd { fd: p.fd, readable: p.readable, writable: p.writable, source: PollSource::Usb }
    }
}

/// Tracks the rediscovery schedule. Owned by `Manager`; `pump.rs` itself
/// holds no libusb state, only the scheduling decision (spec.md §4.8).
pub struct RediscoverySchedule {
    period: Duration,
    next_due: Instant,
    hotplug_active: bool,
}

impl RediscoverySchedule {
    pub fn new(now: Instant) -> Self {
        Self {
            period: DEVICE_POLL_PERIOD,
            next_due: now + DEVICE_POLL_PERIOD,
            hotplug_active: false,
        }
    }

    /// Hotplug supersedes polling: the period becomes effectively infinite
    /// (spec.md §4.8: "sets the period to effectively infinite").
    pub fn set_hotplug_active(&mut self, active: bool, now: Instant) {
        self.hotplug_active = active;
        if !active {
            self.next_due = now + self.period;
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.hotplug_active && now >= self.next_due
    }

    pub fn mark_ran(&mut self, now: Instant) {
        self.next_due = now + self.period;
    }

    /// Time remaining until the next rediscovery tick, or `None` when
    /// hotplug makes polling unnecessary.
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        if self.hotplug_active {
            None
        } else {
            Some(self.next_due.saturating_duration_since(now))
        }
    }
}

/// The next timeout to hand the host loop: the smaller of libusb's own
/// opinion and the time remaining until rediscovery (spec.md §4.8). When
/// neither source has an opinion (typically: hotplug active, so no
/// rediscovery deadline, and libusb has nothing pending either), there is
/// nothing to wake up for — hand back `NO_PENDING_TIMEOUT` instead of 0 ms,
/// which would otherwise spin the host loop at 100% CPU.
pub fn next_timeout(libusb_timeout: Option<Duration>, rediscovery_remaining: Option<Duration>) -> Duration {
    match (libusb_timeout, rediscovery_remaining) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => NO_PENDING_TIMEOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_due_after_its_period_elapses() {
        let start = Instant::now();
        let schedule = RediscoverySchedule::new(start);
        assert!(!schedule.is_due(start));
        assert!(schedule.is_due(start + DEVICE_POLL_PERIOD + Duration::from_millis(1)));
    }

    #[test]
    fn hotplug_active_schedule_is_never_due() {
        let start = Instant::now();
        let mut schedule = RediscoverySchedule::new(start);
        schedule.set_hotplug_active(true, start);
        assert!(!schedule.is_due(start + Duration::from_secs(3600)));
        assert_eq!(schedule.time_remaining(start), None);
    }

    #[test]
    fn next_timeout_picks_the_smaller_duration() {
        let a = Duration::from_millis(500);
        let b = Duration::from_millis(200);
        assert_eq!(next_timeout(Some(a), Some(b)), b);
        assert_eq!(next_timeout(None, Some(b)), b);
        assert_eq!(next_timeout(Some(a), None), a);
    }

    #[test]
    fn next_timeout_blocks_instead_of_spinning_when_nothing_is_pending() {
        assert_eq!(next_timeout(None, None), NO_PENDING_TIMEOUT);
    }
}
