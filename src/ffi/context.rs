//! libusb context lifecycle, device enumeration, event pumping, and
//! hotplug registration (backs C3 and C8).

use crate::error::UsbError;
use std::os::raw::{c_int, c_void};
use std::time::Duration;

/// A `PollFd` the caller's event loop should watch, tagged so a mixed-source
/// loop can tell our fds apart from its own (spec.md §6 `get_fds`).
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: i32,
    pub readable: bool,
    pub writable: bool,
}

/// Owns the libusb context for the process. `init`/`exit` are idempotent at
/// the process level in libusb itself; this wrapper just makes "one
/// context per `Manager`" explicit (spec.md §9 "global mutable state").
pub struct RawContext(*mut libusb1_sys::libusb_context);

impl RawContext {
    pub fn init() -> Result<Self, UsbError> {
        let mut ctx: *mut libusb1_sys::libusb_context = std::ptr::null_mut();
        let rc = unsafe { libusb1_sys::libusb_init(&mut ctx) };
        if rc != 0 {
            return Err(UsbError::InitFailed(crate::error::LibusbErrorCode(rc)));
        }
        Ok(Self(ctx))
    }

    pub(crate) fn as_ptr(&self) -> *mut libusb1_sys::libusb_context {
        self.0
    }

    /// Non-blocking device list fetch (spec.md §4.3 "obtain the current
    /// device list"). Each raw pointer is released by the closure's own
    /// scope via `libusb_free_device_list`; callers get owned descriptor
    /// data out, never the raw `libusb_device*` itself.
    pub fn device_list<T>(
        &self,
        mut visit: impl FnMut(RawDeviceRef) -> T,
    ) -> Result<Vec<T>, UsbError> {
        let mut list: *mut *mut libusb1_sys::libusb_device = std::ptr::null_mut();
        let count = unsafe { libusb1_sys::libusb_get_device_list(self.0, &mut list) };
        if count < 0 {
            return Err(UsbError::from_code(count as i32));
        }
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let dev = unsafe { *list.offset(i as isize) };
            out.push(visit(RawDeviceRef(dev)));
        }
        unsafe { libusb1_sys::libusb_free_device_list(list, 1) };
        Ok(out)
    }

    /// The fds libusb currently wants polled, plus their readiness events.
    pub fn poll_fds(&self) -> Vec<PollFd> {
        let mut result = Vec::new();
        unsafe {
            let raw = libusb1_sys::libusb_get_pollfds(self.0);
            if raw.is_null() {
                return result;
            }
            let mut i = 0isize;
            loop {
                let entry = *raw.offset(i);
                if entry.is_null() {
                    break;
                }
                let pfd = &*entry;
                result.push(PollFd {
                    fd: pfd.fd,
                    readable: pfd.events & libusb1_sys::constants::POLLIN as i16 != 0,
                    writable: pfd.events & libusb1_sys::constants::POLLOUT as i16 != 0,
                });
                i += 1;
            }
            libusb1_sys::libusb_free_pollfds(raw);
        }
        result
    }

    /// libusb's own opinion of its next timeout, if it has one.
    pub fn next_timeout(&self) -> Option<Duration> {
        let mut tv = libusb1_sys::timeval { tv_sec: 0, tv_usec: 0 };
        let rc = unsafe { libusb1_sys::libusb_get_next_timeout(self.0, &mut tv) };
        if rc == 0 {
            None
        } else if rc < 0 {
            None
        } else {
            Some(Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1000))
        }
    }

    /// Services ready events and fires any due transfer callbacks.
    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<(), UsbError> {
        let tv = libusb1_sys::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        let rc = unsafe { libusb1_sys::libusb_handle_events_timeout(self.0, &tv) };
        if rc < 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(())
    }

    pub fn has_hotplug(&self) -> bool {
        unsafe {
            libusb1_sys::libusb_has_capability(libusb1_sys::constants::LIBUSB_CAP_HAS_HOTPLUG) != 0
        }
    }

    /// Registers for arrival/departure events on `vendor_id`, enumerating
    /// already-attached matches immediately (spec.md §4.8). `callback`'s
    /// `user_data` must stay valid until `deregister_hotplug` is called.
    ///
    /// # Safety
    /// `user_data` must outlive the registration.
    pub unsafe fn register_hotplug(
        &self,
        vendor_id: u16,
        callback: libusb1_sys::libusb_hotplug_callback_fn,
        user_data: *mut c_void,
    ) -> Result<HotplugHandle, UsbError> {
        let mut handle: libusb1_sys::libusb_hotplug_callback_handle = 0;
        let events = libusb1_sys::constants::LIBUSB_HOTPLUG_EVENT_DEVICE_ARRIVED
            | libusb1_sys::constants::LIBUSB_HOTPLUG_EVENT_DEVICE_LEFT;
        let rc = unsafe {
            libusb1_sys::libusb_hotplug_register_callback(
                self.0,
                events,
                libusb1_sys::constants::LIBUSB_HOTPLUG_ENUMERATE,
                vendor_id as c_int,
                libusb1_sys::constants::LIBUSB_HOTPLUG_MATCH_ANY,
                libusb1_sys::constants::LIBUSB_HOTPLUG_MATCH_ANY,
                callback,
                user_data,
                &mut handle,
            )
        };
        if rc != 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(HotplugHandle(handle))
    }

    pub fn deregister_hotplug(&self, handle: HotplugHandle) {
        unsafe { libusb1_sys::libusb_hotplug_deregister_callback(self.0, handle.0) };
    }
}

impl Drop for RawContext {
    fn drop(&mut self) {
        unsafe { libusb1_sys::libusb_exit(self.0) };
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HotplugHandle(libusb1_sys::libusb_hotplug_callback_handle);

/// A borrowed `libusb_device*`, valid only for the duration of the
/// `device_list` visitor call (or hotplug callback) that handed it out.
#[derive(Clone, Copy)]
pub struct RawDeviceRef(*mut libusb1_sys::libusb_device);

impl RawDeviceRef {
    pub fn bus_number(&self) -> u8 {
        unsafe { libusb1_sys::libusb_get_bus_number(self.0) }
    }

    pub fn device_address(&self) -> u8 {
        unsafe { libusb1_sys::libusb_get_device_address(self.0) }
    }

    pub fn descriptor(&self) -> Result<crate::device::DeviceDescriptor, UsbError> {
        unsafe { super::descriptor::read_device_descriptor(self.0) }
    }

    pub fn speed(&self) -> crate::device::LinkSpeed {
        let raw = unsafe { libusb1_sys::libusb_get_device_speed(self.0) };
        crate::device::LinkSpeed::from_libusb_speed(raw)
    }

    pub fn config_descriptor_by_value(
        &self,
        value: u8,
    ) -> Result<super::ConfigDescriptor, UsbError> {
        unsafe { super::descriptor::read_config_descriptor_by_value(self.0, value) }
    }

    pub fn config_descriptor(&self, index: u8) -> Result<super::ConfigDescriptor, UsbError> {
        unsafe { super::descriptor::read_config_descriptor(self.0, index) }
    }

    pub fn max_packet_size(&self, ep_addr: u8) -> Option<u16> {
        unsafe { super::descriptor::max_packet_size(self.0, ep_addr) }
    }

    /// Opens the device. No blocking operation may follow this call in a
    /// hotplug callback context (spec.md §4.3) — this function itself is
    /// non-blocking, matching `libusb_open`'s documented behavior.
    pub fn open(&self) -> Result<super::RawDeviceHandle, UsbError> {
        let mut handle: *mut libusb1_sys::libusb_device_handle = std::ptr::null_mut();
        let rc = unsafe { libusb1_sys::libusb_open(self.0, &mut handle) };
        if rc != 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(unsafe { super::RawDeviceHandle::from_raw(handle) })
    }

    pub(crate) fn as_ptr(&self) -> *mut libusb1_sys::libusb_device {
        self.0
    }

    /// Takes an extra reference on the underlying `libusb_device`, so this
    /// pointer stays valid past the `device_list` call that produced it
    /// (libusb's documented pattern: ours is on top of the transient list
    /// reference that `libusb_free_device_list(list, 1)` drops once the
    /// scan loop finishes). Must be paired with exactly one `release()`.
    pub fn upgrade(&self) -> RawDeviceRef {
        unsafe { libusb1_sys::libusb_ref_device(self.0) };
        RawDeviceRef(self.0)
    }

    /// Drops a reference taken by `upgrade`.
    pub fn release(self) {
        unsafe { libusb1_sys::libusb_unref_device(self.0) };
    }
}

/// Wraps the `libusb_device*` a hotplug callback is handed, for the
/// duration of that callback only.
pub fn device_ref_from_hotplug(ptr: *mut libusb1_sys::libusb_device) -> RawDeviceRef {
    RawDeviceRef(ptr)
}

/// Recovers the owning `libusb_device*` from an open handle — used by the
/// configuration selector, which needs descriptor data again once the
/// device is already open and the original `RawDeviceRef` from discovery
/// is long gone. `libusb_get_device` does not take a reference, so this
/// borrow is only valid as long as `handle` stays open.
pub fn device_ref_from_handle(handle: &super::RawDeviceHandle) -> RawDeviceRef {
    RawDeviceRef(unsafe { libusb1_sys::libusb_get_device(handle.as_ptr()) })
}

/// Operations bound to an open device handle (claim/release, configuration,
/// kernel driver detach).
pub struct RawHandleOps;

impl RawHandleOps {
    pub fn set_configuration(
        handle: &super::RawDeviceHandle,
        value: c_int,
    ) -> Result<(), UsbError> {
        let rc = unsafe { libusb1_sys::libusb_set_configuration(handle.as_ptr(), value) };
        if rc != 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(())
    }

    pub fn claim_interface(
        handle: &super::RawDeviceHandle,
        interface_number: c_int,
    ) -> Result<(), UsbError> {
        let rc = unsafe { libusb1_sys::libusb_claim_interface(handle.as_ptr(), interface_number) };
        if rc != 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(())
    }

    pub fn release_interface(handle: &super::RawDeviceHandle, interface_number: c_int) {
        unsafe { libusb1_sys::libusb_release_interface(handle.as_ptr(), interface_number) };
    }

    /// Best-effort kernel driver detach: failures are the caller's to log,
    /// never to abort on (spec.md §4.5).
    pub fn detach_kernel_driver_if_active(
        handle: &super::RawDeviceHandle,
        interface_number: c_int,
    ) -> Result<bool, UsbError> {
        let active = unsafe {
            libusb1_sys::libusb_kernel_driver_active(handle.as_ptr(), interface_number)
        };
        if active < 0 {
            return Err(UsbError::from_code(active));
        }
        if active == 0 {
            return Ok(false);
        }
        let rc = unsafe {
            libusb1_sys::libusb_detach_kernel_driver(handle.as_ptr(), interface_number)
        };
        if rc != 0 {
            return Err(UsbError::from_code(rc));
        }
        Ok(true)
    }

    pub fn get_configuration(handle: &super::RawDeviceHandle) -> Result<c_int, UsbError> {
        unsafe { super::descriptor::get_configuration(handle.as_ptr()) }
    }
}
