//! The trait the external collaborator implements (spec.md §6, "operations
//! the core consumes from collaborators").

use crate::device::{DeviceInfo, DeviceLocation};
use crate::error::CollaboratorError;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Spew,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

/// Everything above the bulk endpoints — the multiplexing protocol, the
/// control socket, session handling — is the collaborator. The core only
/// ever calls these five methods; it never inspects payload bytes itself.
pub trait Collaborator {
    /// Called once per device after its serial is known. A non-`Ok` return
    /// aborts initialization and the device is disconnected (spec.md §6).
    fn device_add(&mut self, device: &DeviceInfo) -> Result<(), CollaboratorError>;

    /// Called on doom, before the device's transfer handles are freed.
    fn device_remove(&mut self, location: DeviceLocation);

    /// Delivers a read payload. `data` must not be retained past the call.
    fn device_data_input(&mut self, location: DeviceLocation, data: &[u8]);

    fn log(&self, level: LogLevel, message: &str);

    /// Monotonic clock read, used for rediscovery scheduling and the
    /// disconnect drain bound (spec.md §6's `get_tick_count`).
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A `Collaborator` that only logs through `tracing`, useful for examples
/// and crate-level tests that don't care about the multiplexing protocol
/// (SPEC_FULL.md §11.1).
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct TracingCollaborator;

#[cfg(any(test, feature = "test-support"))]
impl Collaborator for TracingCollaborator {
    fn device_add(&mut self, device: &DeviceInfo) -> Result<(), CollaboratorError> {
        tracing::info!(?device.location, serial = %device.serial, "device_add");
        Ok(())
    }

    fn device_remove(&mut self, location: DeviceLocation) {
        tracing::info!(?location, "device_remove");
    }

    fn device_data_input(&mut self, location: DeviceLocation, data: &[u8]) {
        tracing::trace!(?location, len = data.len(), "device_data_input");
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Spew | LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info | LogLevel::Notice => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error | LogLevel::Fatal => tracing::error!("{message}"),
        }
    }
}
