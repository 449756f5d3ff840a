//! Error types. `thiserror` for the leaf enums, no `anyhow` inside the
//! library (see SPEC_FULL.md §11.2).

use crate::device::DeviceLocation;
use std::fmt;

/// A raw libusb return code, kept around verbatim for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibusbErrorCode(pub i32);

impl fmt::Display for LibusbErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", libusb_error_name(self.0), self.0)
    }
}

/// Translates a libusb error code into its symbolic name, for logs. Falls
/// back to the bare number for anything this crate doesn't special-case.
pub fn libusb_error_name(code: i32) -> &'static str {
    use libusb1_sys::constants::*;
    match code {
        LIBUSB_SUCCESS => "LIBUSB_SUCCESS",
        LIBUSB_ERROR_IO => "LIBUSB_ERROR_IO",
        LIBUSB_ERROR_INVALID_PARAM => "LIBUSB_ERROR_INVALID_PARAM",
        LIBUSB_ERROR_ACCESS => "LIBUSB_ERROR_ACCESS",
        LIBUSB_ERROR_NO_DEVICE => "LIBUSB_ERROR_NO_DEVICE",
        LIBUSB_ERROR_NOT_FOUND => "LIBUSB_ERROR_NOT_FOUND",
        LIBUSB_ERROR_BUSY => "LIBUSB_ERROR_BUSY",
        LIBUSB_ERROR_TIMEOUT => "LIBUSB_ERROR_TIMEOUT",
        LIBUSB_ERROR_OVERFLOW => "LIBUSB_ERROR_OVERFLOW",
        LIBUSB_ERROR_PIPE => "LIBUSB_ERROR_PIPE",
        LIBUSB_ERROR_INTERRUPTED => "LIBUSB_ERROR_INTERRUPTED",
        LIBUSB_ERROR_NO_MEM => "LIBUSB_ERROR_NO_MEM",
        LIBUSB_ERROR_NOT_SUPPORTED => "LIBUSB_ERROR_NOT_SUPPORTED",
        LIBUSB_ERROR_OTHER => "LIBUSB_ERROR_OTHER",
        _ => "LIBUSB_ERROR_UNKNOWN",
    }
}

/// Errors a public `Manager` entry point can return to its caller.
#[derive(thiserror::Error, Debug)]
pub enum UsbError {
    #[error("libusb call failed: {0}")]
    Libusb(LibusbErrorCode),

    #[error("no live device at {0:?}")]
    DeviceNotFound(DeviceLocation),

    #[error("too many consecutive failures getting the device list")]
    FatalDiscovery,

    #[error("libusb context failed to initialize: {0}")]
    InitFailed(LibusbErrorCode),
}

impl UsbError {
    pub fn from_code(code: i32) -> Self {
        UsbError::Libusb(LibusbErrorCode(code))
    }
}

/// Error surfaced by a collaborator's `device_add` to abort an
/// in-progress device initialization (spec.md §6: "non-zero return aborts
/// initialization and disconnects the device").
#[derive(thiserror::Error, Debug)]
#[error("collaborator rejected device: {reason}")]
pub struct CollaboratorError {
    pub reason: String,
}

impl CollaboratorError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}
