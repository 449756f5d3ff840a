//! Raw bindings to libusb-1.0 (`libusb1-sys`), thinly wrapped. Everything
//! above this module talks in `DeviceLocation`s and plain Rust structs; this
//! is the only place that holds a `*mut libusb_*` pointer.

pub mod context;
pub mod descriptor;
pub mod transfer;

pub use context::RawContext;
pub use descriptor::{ConfigDescriptor, EndpointDescriptor, InterfaceDescriptor};

use std::ptr::NonNull;

/// An opened device handle. Present iff the device record is alive
/// (spec.md §3: "non-null iff the record is alive").
///
/// Not `Send`/`Sync`: libusb device handles are only safe to use from
/// threads that also pump that context's events, and this crate's whole
/// contract (§5) is that everything happens on one thread.
pub struct RawDeviceHandle(NonNull<libusb1_sys::libusb_device_handle>);

impl RawDeviceHandle {
    /// # Safety
    /// `ptr` must be a handle just returned by `libusb_open` with a
    /// success status, and not yet passed to `libusb_close`.
    pub(crate) unsafe fn from_raw(ptr: *mut libusb1_sys::libusb_device_handle) -> Self {
        Self(NonNull::new(ptr).expect("libusb_open reported success with a null handle"))
    }

    pub(crate) fn as_ptr(&self) -> *mut libusb1_sys::libusb_device_handle {
        self.0.as_ptr()
    }

    pub(crate) unsafe fn close(self) {
        libusb1_sys::libusb_close(self.0.as_ptr());
    }

    /// Construct a handle that must never be passed to a real libusb call.
    /// Exists only so `DeviceTable` unit tests can build a `Device` without
    /// opening real hardware.
    #[cfg(test)]
    pub(crate) unsafe fn dangling_for_tests() -> Self {
        Self(NonNull::dangling())
    }
}
