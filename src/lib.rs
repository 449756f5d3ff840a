//! USB device manager for an Apple mobile device multiplexer: discovery,
//! mode negotiation, configuration, serial identification, and bulk I/O
//! pumping over libusb-1.0. See `SPEC_FULL.md` for the full behavioral
//! specification this crate implements.
//!
//! The core never speaks the multiplexing protocol itself — it hands
//! payload bytes and lifecycle events to a [`Collaborator`] and otherwise
//! only deals in raw USB transfers (spec.md §6).

pub mod bulk;
pub mod collaborator;
pub mod config;
pub mod config_select;
pub mod constants;
pub mod device;
pub mod enumeration;
pub mod error;
pub mod ffi;
pub mod manager;
pub mod mode;
pub mod pump;
pub mod reaper;
pub mod serial;
pub mod table;
pub mod transfers;

pub use collaborator::{Collaborator, LogLevel};
pub use device::{DeviceInfo, DeviceLocation};
pub use error::{CollaboratorError, UsbError};
pub use manager::Manager;
pub use pump::PollFd;

#[cfg(any(test, feature = "test-support"))]
pub use collaborator::TracingCollaborator;
