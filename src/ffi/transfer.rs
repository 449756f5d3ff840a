//! Async transfer plumbing: allocate, fill, submit, cancel, free. This is
//! the direct Rust counterpart of `usb.c`'s `libusb_alloc_transfer` /
//! `libusb_fill_*_transfer` / `libusb_submit_transfer` calls — the one part
//! of libusb with no safe wrapper in `libusb1-sys`, so we own it here.

use libusb1_sys::{constants::*, libusb_transfer};
use std::os::raw::c_void;
use std::time::Duration;

/// Size of the 8-byte setup packet prepended to a control transfer buffer.
pub const CONTROL_SETUP_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub(crate) fn from_raw(status: i32) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

/// A leaked, in-flight transfer. Freed exactly once, either by its
/// callback (the normal path) or by the reaper's forced cleanup after the
/// disconnect drain bound expires (spec.md §4.9).
pub struct RawTransfer(*mut libusb_transfer);

impl RawTransfer {
    pub fn as_ptr(&self) -> *mut libusb_transfer {
        self.0
    }

    /// Identity used as the transfer-registry key: the pointer's address.
    /// Never dereferenced as an address by the registry itself.
    pub fn id(&self) -> usize {
        self.0 as usize
    }

    pub fn cancel(&self) {
        unsafe {
            libusb1_sys::libusb_cancel_transfer(self.0);
        }
    }

    /// # Safety
    /// Must only be called once a completion (or cancellation) callback
    /// has actually run for this transfer (spec.md §3 invariant 2).
    pub unsafe fn free(self) {
        unsafe { libusb1_sys::libusb_free_transfer(self.0) };
    }

    fn status(&self) -> TransferStatus {
        TransferStatus::from_raw(unsafe { (*self.0).status })
    }

    fn actual_length(&self) -> usize {
        unsafe { (*self.0).actual_length as usize }
    }

    /// Borrowed view of the data, valid only within the callback that
    /// observed this status (never retained past the call, per spec.md
    /// §6's `device_data_input` contract).
    fn buffer(&self) -> &[u8] {
        unsafe {
            let xfer = &*self.0;
            std::slice::from_raw_parts(xfer.buffer, xfer.length as usize)
        }
    }

    /// Takes back ownership of the heap buffer this transfer pointed at,
    /// so it can be dropped. Must be called at most once per transfer.
    unsafe fn take_buffer(&self, len: usize) -> Box<[u8]> {
        unsafe {
            let xfer = &*self.0;
            let raw = std::slice::from_raw_parts_mut(xfer.buffer, len);
            Box::from_raw(raw as *mut [u8])
        }
    }
}

/// Outcome handed to a bulk-transfer completion handler.
pub struct BulkCompletion<'a> {
    pub status: TransferStatus,
    pub data: &'a [u8],
}

/// Outcome handed to a control-transfer completion handler. `data` is the
/// response payload (setup packet already stripped).
pub struct ControlCompletion<'a> {
    pub status: TransferStatus,
    pub data: &'a [u8],
}

/// Submits a bulk transfer over `buffer`, which this call takes ownership
/// of; it is handed back (for freeing) only inside the callback. `context`
/// is leaked as the transfer's `user_data` and must be reclaimed by
/// `trampoline` (passed in as `callback`).
///
/// # Safety
/// `handle` must be open and `endpoint` must belong to a claimed interface
/// on it. `callback` must match the layout `trampoline` below expects —
/// i.e. it must have been produced by this module's own dispatch helpers.
pub unsafe fn submit_bulk<Ctx>(
    handle: *mut libusb1_sys::libusb_device_handle,
    endpoint: u8,
    buffer: Box<[u8]>,
    callback: extern "C" fn(*mut libusb_transfer),
    context: Ctx,
) -> Result<RawTransfer, (i32, Box<[u8]>)> {
    let xfer = unsafe { libusb1_sys::libusb_alloc_transfer(0) };
    let len = buffer.len();
    let raw_buf = Box::into_raw(buffer) as *mut u8;
    let user_data = Box::into_raw(Box::new(context)) as *mut c_void;
    unsafe {
        libusb1_sys::libusb_fill_bulk_transfer(
            xfer,
            handle,
            endpoint,
            raw_buf,
            len as i32,
            Some(callback),
            user_data,
            0, // infinite timeout for bulk transfers (spec.md §5)
        );
    }
    let rc = unsafe { libusb1_sys::libusb_submit_transfer(xfer) };
    if rc != 0 {
        unsafe {
            // Reclaim both leaks; nothing was ever handed to libusb.
            drop(Box::from_raw(user_data as *mut Ctx));
            let buf = Box::from_raw(std::slice::from_raw_parts_mut(raw_buf, len) as *mut [u8]);
            libusb1_sys::libusb_free_transfer(xfer);
            return Err((rc, buf));
        }
    }
    Ok(RawTransfer(xfer))
}

/// Submits a vendor-specific control IN transfer
/// (`bmRequestType = VENDOR | IN | DEVICE`), matching
/// `submit_vendor_specific` in the original.
///
/// # Safety
/// See `submit_bulk`.
pub unsafe fn submit_vendor_control_in<Ctx>(
    handle: *mut libusb1_sys::libusb_device_handle,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: Duration,
    callback: extern "C" fn(*mut libusb_transfer),
    context: Ctx,
) -> Result<RawTransfer, i32> {
    let request_type = LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_ENDPOINT_IN | LIBUSB_RECIPIENT_DEVICE;
    submit_control(
        handle,
        request_type,
        request,
        value,
        index,
        length,
        timeout,
        callback,
        context,
    )
}

/// Submits a standard `GET_DESCRIPTOR` control IN transfer (used for the
/// language-id table and the serial-number string, spec.md §4.6).
///
/// # Safety
/// See `submit_bulk`.
pub unsafe fn submit_get_descriptor<Ctx>(
    handle: *mut libusb1_sys::libusb_device_handle,
    descriptor_type: u8,
    descriptor_index: u8,
    language_id: u16,
    length: u16,
    timeout: Duration,
    callback: extern "C" fn(*mut libusb_transfer),
    context: Ctx,
) -> Result<RawTransfer, i32> {
    let value = ((descriptor_type as u16) << 8) | descriptor_index as u16;
    submit_control(
        handle,
        LIBUSB_ENDPOINT_IN,
        LIBUSB_REQUEST_GET_DESCRIPTOR,
        value,
        language_id,
        length,
        timeout,
        callback,
        context,
    )
}

#[allow(clippy::too_many_arguments)]
unsafe fn submit_control<Ctx>(
    handle: *mut libusb1_sys::libusb_device_handle,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: Duration,
    callback: extern "C" fn(*mut libusb_transfer),
    context: Ctx,
) -> Result<RawTransfer, i32> {
    let total = CONTROL_SETUP_SIZE + length as usize;
    let mut buffer = vec![0u8; total].into_boxed_slice();
    fill_control_setup(&mut buffer, request_type, request, value, index, length);
    let raw_buf = Box::into_raw(buffer) as *mut u8;

    let xfer = unsafe { libusb1_sys::libusb_alloc_transfer(0) };
    let user_data = Box::into_raw(Box::new(context)) as *mut c_void;
    unsafe {
        libusb1_sys::libusb_fill_control_transfer(
            xfer,
            handle,
            raw_buf,
            Some(callback),
            user_data,
            timeout.as_millis() as u32,
        );
    }
    let rc = unsafe { libusb1_sys::libusb_submit_transfer(xfer) };
    if rc != 0 {
        unsafe {
            drop(Box::from_raw(user_data as *mut Ctx));
            drop(Box::from_raw(
                std::slice::from_raw_parts_mut(raw_buf, total) as *mut [u8],
            ));
            libusb1_sys::libusb_free_transfer(xfer);
        }
        return Err(rc);
    }
    Ok(RawTransfer(xfer))
}

/// Fills in an 8-byte USB control setup packet at the start of `buffer`,
/// the way `libusb_fill_control_setup` does (that function is a header
/// inline in libusb, not an exported symbol, so this crate reimplements
/// its trivial byte layout directly).
fn fill_control_setup(
    buffer: &mut [u8],
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) {
    buffer[0] = request_type;
    buffer[1] = request;
    buffer[2..4].copy_from_slice(&value.to_le_bytes());
    buffer[4..6].copy_from_slice(&index.to_le_bytes());
    buffer[6..8].copy_from_slice(&length.to_le_bytes());
}

/// Completion dispatch for a bulk transfer's raw callback. Takes back
/// ownership of `Ctx` and, on a terminal status, the data buffer; `keep`
/// decides whether the buffer is handed back for resubmission (`true`, rx
/// resubmit path) or dropped (`false`, everything else).
///
/// # Safety
/// `xfer` must be a transfer this module submitted via `submit_bulk` with
/// a matching `Ctx` type, and this must be the only place `xfer`'s
/// `user_data` is reclaimed.
pub unsafe fn on_bulk_complete<Ctx>(
    xfer: *mut libusb_transfer,
) -> (Ctx, TransferStatus, Box<[u8]>, usize) {
    let raw = RawTransfer(xfer);
    let status = raw.status();
    let actual = raw.actual_length();
    let len = unsafe { (*xfer).length as usize };
    let ctx = unsafe { *Box::from_raw((*xfer).user_data as *mut Ctx) };
    let buffer = unsafe { raw.take_buffer(len) };
    (ctx, status, buffer, actual)
}

/// Completion dispatch for a control transfer's raw callback, mirroring
/// `on_bulk_complete` but slicing off the 8-byte setup header the way
/// `libusb_control_transfer_get_data` does (also a header-only inline, so
/// reimplemented here).
///
/// `xfer.length` already counts the setup header (it was filled as
/// `CONTROL_SETUP_SIZE + wLength` by `submit_control`), so the full
/// buffer taken back is exactly that size; the setup header is then
/// sliced off and the response truncated to `actual_length`, the number
/// of response bytes the device actually returned.
///
/// # Safety
/// Same contract as `on_bulk_complete`.
pub unsafe fn on_control_complete<Ctx>(
    xfer: *mut libusb_transfer,
) -> (Ctx, TransferStatus, Box<[u8]>) {
    let raw = RawTransfer(xfer);
    let status = raw.status();
    let actual = raw.actual_length();
    let total_len = unsafe { (*xfer).length as usize };
    let ctx = unsafe { *Box::from_raw((*xfer).user_data as *mut Ctx) };
    let full = unsafe { raw.take_buffer(total_len) };
    let start = CONTROL_SETUP_SIZE.min(full.len());
    let end = (start + actual).min(full.len());
    let data = full[start..end].to_vec().into_boxed_slice();
    (ctx, status, data)
}

/// Re-submits an rx transfer with the same buffer it was just handed back
/// (the original's read-callback loop, spec.md §4.7). Takes the buffer by
/// value and leaks it again for libusb.
///
/// # Safety
/// `xfer` must be the same transfer `on_bulk_complete` was just called on,
/// not yet freed, and `buffer`/`context` must outlive the next callback.
pub unsafe fn resubmit_bulk<Ctx>(
    xfer: *mut libusb_transfer,
    buffer: Box<[u8]>,
    context: Ctx,
) -> Result<(), i32> {
    let len = buffer.len();
    let raw_buf = Box::into_raw(buffer) as *mut u8;
    let user_data = Box::into_raw(Box::new(context)) as *mut c_void;
    unsafe {
        (*xfer).buffer = raw_buf;
        (*xfer).length = len as i32;
        (*xfer).user_data = user_data;
    }
    let rc = unsafe { libusb1_sys::libusb_submit_transfer(xfer) };
    if rc != 0 {
        unsafe {
            drop(Box::from_raw(user_data as *mut Ctx));
            drop(Box::from_raw(
                std::slice::from_raw_parts_mut(raw_buf, len) as *mut [u8],
            ));
        }
        return Err(rc);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_setup_byte_layout_matches_usb_spec() {
        let mut buf = [0u8; CONTROL_SETUP_SIZE];
        fill_control_setup(&mut buf, 0xC0, 0x45, 0x1234, 0x0000, 4);
        assert_eq!(buf[0], 0xC0);
        assert_eq!(buf[1], 0x45);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x1234);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 0x0000);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 4);
    }

    #[test]
    fn transfer_status_maps_known_libusb_codes() {
        assert_eq!(TransferStatus::from_raw(LIBUSB_TRANSFER_COMPLETED), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_raw(LIBUSB_TRANSFER_CANCELLED), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from_raw(LIBUSB_TRANSFER_NO_DEVICE), TransferStatus::NoDevice);
        assert!(!TransferStatus::from_raw(LIBUSB_TRANSFER_STALL).is_success());
        assert!(TransferStatus::from_raw(LIBUSB_TRANSFER_COMPLETED).is_success());
    }
}
