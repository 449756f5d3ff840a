//! Public API (spec.md §6): the `Manager` that owns the libusb context,
//! the device table, and the transfer registry, and drives every device
//! through the state machine in `device.rs` (spec.md §4.10, §9 "global
//! mutable state" design note).

use crate::collaborator::{Collaborator, LogLevel};
use crate::config_select::{self, Selection};
use crate::constants::{CONTROL_TRANSFER_TIMEOUT, MAX_DEVLIST_FAILURES, VID_APPLE};
use crate::device::{AliveState, Device, DeviceDescriptor, DeviceInfo, DeviceLocation, DeviceState, InterfaceSelection};
use crate::error::UsbError;
use crate::ffi::context::{self, HotplugHandle, RawContext, RawDeviceRef};
use crate::ffi::{RawDeviceHandle, RawHandleOps};
use crate::ffi::transfer::{self, BulkCompletion, ControlCompletion, TransferStatus};
use crate::mode::{self, GuessedMode, ModeNegotiation};
use crate::pump::{PollFd, RediscoverySchedule};
use crate::reaper::{Drain, DrainOutcome};
use crate::serial;
use crate::table::DeviceTable;
use crate::transfers::{TransferId, TransferKind, TransferRegistry};

use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::time::{Duration, Instant};

/// Per-device bookkeeping the manager needs beyond what lives in the
/// device table proper: the in-progress mode negotiation and the drain
/// tracker used while disconnecting.
#[derive(Default)]
struct DeviceBookkeeping {
    negotiation: Option<ModeNegotiation>,
    drain: Option<Drain>,
}

/// Operation a pending transfer's completion should dispatch to.
enum PendingOp {
    GetMode,
    SetMode,
    GetLangId,
    GetSerial { lang_id: u16 },
    Rx { slot: usize },
    Tx,
    TxZlp,
}

/// Carried as a submitted transfer's `user_data`. `manager` is a raw,
/// non-owning pointer back to the `Manager` that submitted it; valid only
/// because the manager's address does not move while transfers naming it
/// are outstanding (the same global-state-by-pointer discipline the
/// original C core relies on, reified here instead of as a process-wide
/// static — SPEC_FULL.md §9). `Manager::init`/`Manager::shutdown` take and
/// return `Box<Manager<C>>` specifically to uphold this: the manager gets
/// its final heap address before the first pointer naming it is ever handed
/// to libusb, and stays there until every transfer naming it has been freed.
struct CallbackContext<C: Collaborator> {
    manager: *mut Manager<C>,
    location: DeviceLocation,
    op: PendingOp,
}

/// The core USB device manager. Neither `Send` nor `Sync`: it holds raw
/// libusb pointers usable only from the thread that drives `process()`
/// (spec.md §5).
pub struct Manager<C: Collaborator> {
    context: RawContext,
    table: DeviceTable,
    transfers: TransferRegistry,
    bookkeeping: HashMap<DeviceLocation, DeviceBookkeeping>,
    collaborator: C,
    schedule: RediscoverySchedule,
    hotplug: Option<HotplugHandle>,
    devlist_failures: u32,
    autodiscover_enabled: bool,
    hotplug_arrivals_enabled: bool,
}

impl<C: Collaborator> Manager<C> {
    /// Initializes the libusb context, registers hotplug if available,
    /// runs one discovery pass, and returns the device count (spec.md §6
    /// `init`).
    ///
    /// Returns a `Box<Self>` rather than `Self`: `register_hotplug_if_available`
    /// and the first `discover()` both hand out `self as *mut Self` as
    /// transfer/hotplug `user_data` (`CallbackContext::manager`), which is
    /// only sound if the manager's address never moves afterward (see
    /// `CallbackContext`'s doc comment). Boxing before either call gives the
    /// manager its final heap address up front, so returning or storing the
    /// `Box` later can't relocate it out from under an in-flight callback.
    pub fn init(collaborator: C) -> Result<(Box<Self>, usize), UsbError> {
        let context = RawContext::init()?;
        let now = collaborator.now();
        let manager = Manager {
            context,
            table: DeviceTable::new(),
            transfers: TransferRegistry::new(),
            bookkeeping: HashMap::new(),
            collaborator,
            schedule: RediscoverySchedule::new(now),
            hotplug: None,
            devlist_failures: 0,
            autodiscover_enabled: true,
            hotplug_arrivals_enabled: true,
        };
        let mut manager = Box::new(manager);
        manager.register_hotplug_if_available();
        let count = manager.discover()?;
        Ok((manager, count))
    }

    fn register_hotplug_if_available(&mut self) {
        if !self.context.has_hotplug() {
            return;
        }
        let self_ptr = self as *mut Self as *mut c_void;
        let handle = unsafe { self.context.register_hotplug(VID_APPLE, Some(hotplug_trampoline::<C>), self_ptr) };
        match handle {
            Ok(h) => {
                self.hotplug = Some(h);
                let now = self.collaborator.now();
                self.schedule.set_hotplug_active(true, now);
            }
            Err(e) => self.collaborator.log(LogLevel::Warning, &format!("hotplug registration failed: {e}")),
        }
    }

    /// Orderly process-wide teardown (spec.md §4.9 "process shutdown").
    ///
    /// Takes `self: Box<Self>` rather than `Self` so the manager's address
    /// never moves while it still has outstanding transfers naming it — the
    /// same reasoning as `init`'s return type. The drain loop below pumps
    /// events (and so can run transfer callbacks) before the box is finally
    /// dropped.
    pub fn shutdown(mut self: Box<Self>) {
        if let Some(h) = self.hotplug.take() {
            self.context.deregister_hotplug(h);
        }
        let locations: Vec<DeviceLocation> = self.table.iter().map(|d| d.location).collect();
        for location in locations {
            self.begin_disconnect(location);
        }
        let deadline = self.collaborator.now() + Duration::from_millis(200);
        while !self.table.is_empty() && self.collaborator.now() < deadline {
            let _ = self.context.handle_events_timeout(Duration::from_millis(1));
            self.drive_drains();
        }
        // RawContext::drop runs libusb_exit.
    }

    /// Forces a rediscovery scan (spec.md §6 `discover`).
    pub fn discover(&mut self) -> Result<usize, UsbError> {
        self.table.begin_scan();

        // Only new devices need their `libusb_device*` to survive past this
        // call (to be opened below); `upgrade()` takes an extra reference so
        // it outlives `device_list`'s own `libusb_free_device_list(list, 1)`
        // (see `RawDeviceRef::upgrade`).
        let candidates = self.context.device_list(|dref: RawDeviceRef| {
            let descriptor = dref.descriptor();
            let location = DeviceLocation::new(dref.bus_number(), dref.device_address());
            let speed = dref.speed();
            let already_known = self.table.contains(location);
            let kept = if already_known { None } else { Some(dref.upgrade()) };
            (location, descriptor, speed, kept)
        });

        let candidates = match candidates {
            Ok(c) => {
                self.devlist_failures = 0;
                c
            }
            Err(e) => {
                self.devlist_failures += 1;
                self.collaborator.log(LogLevel::Warning, &format!("device list fetch failed: {e}"));
                if self.devlist_failures > MAX_DEVLIST_FAILURES {
                    self.collaborator.log(LogLevel::Fatal, "too many consecutive device-list failures");
                    return Err(UsbError::FatalDiscovery);
                }
                return Ok(self.table.len());
            }
        };

        for (location, descriptor, speed, kept) in candidates {
            let descriptor = match descriptor {
                Ok(d) => d,
                Err(_) => {
                    if let Some(k) = kept {
                        k.release();
                    }
                    continue;
                }
            };
            if !crate::enumeration::is_candidate(&descriptor) {
                if let Some(k) = kept {
                    k.release();
                }
                continue;
            }
            match kept {
                None => self.table.mark_seen(location),
                Some(dref) => {
                    let opened = dref.open();
                    dref.release();
                    match opened {
                        Ok(handle) => self.begin_negotiation(location, descriptor, speed, handle),
                        Err(e) => self.collaborator.log(LogLevel::Warning, &format!("open failed for {location:?}: {e}")),
                    }
                }
            }
        }

        for doomed in self.table.sweep_unseen() {
            self.collaborator.log(LogLevel::Info, &format!("device {doomed:?} not re-observed, reaping"));
            self.begin_disconnect(doomed);
        }

        tracing::trace!(count = self.table.len(), "discover scan complete");
        Ok(self.table.len())
    }

    fn begin_negotiation(
        &mut self,
        location: DeviceLocation,
        descriptor: DeviceDescriptor,
        speed: crate::device::LinkSpeed,
        handle: RawDeviceHandle,
    ) {
        let mut device = Device::new(location, descriptor, handle);
        device.speed = speed;
        device.state = DeviceState::ProbingMode;
        self.table.insert(device);
        self.table.mark_seen(location);
        self.bookkeeping.insert(location, DeviceBookkeeping::default());
        self.submit_get_mode(location);
    }

    fn submit_get_mode(&mut self, location: DeviceLocation) {
        let Some(device) = self.table.get(location) else { return };
        let Some(handle) = &device.handle else { return };
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::GetMode };
        let result = unsafe {
            transfer::submit_vendor_control_in(
                handle.as_ptr(),
                mode::GetModeRequest::REQUEST,
                0,
                0,
                mode::GetModeRequest::LENGTH,
                CONTROL_TRANSFER_TIMEOUT,
                control_trampoline::<C>,
                ctx,
            )
        };
        if let Err(code) = result {
            self.collaborator.log(LogLevel::Warning, &format!("GET_MODE submit failed ({code}), continuing in current mode"));
            self.configure_device(location);
        } else if let Ok(xfer) = result {
            self.track(location, xfer.id(), TransferKind::Control);
        }
    }

    fn on_get_mode_complete(&mut self, location: DeviceLocation, status: TransferStatus, data: &[u8]) {
        let desired = crate::config::desired_mode();
        let guessed = if status.is_success() && data.len() >= 4 {
            self.collaborator.log(
                LogLevel::Info,
                &format!("get_mode response: {}:{}:{}:{}", data[0], data[1], data[2], data[3]),
            );
            self.classify_guessed_mode(location)
        } else {
            GuessedMode::Undetermined
        };

        if let Some(book) = self.bookkeeping.get_mut(&location) {
            book.negotiation = Some(ModeNegotiation { desired, guessed });
        }

        if mode::should_switch(guessed, desired) {
            if let Some(device) = self.table.get_mut(location) {
                device.state = DeviceState::SwitchingMode;
            }
            self.submit_set_mode(location, desired);
        } else {
            self.configure_device(location);
        }
    }

    fn classify_guessed_mode(&mut self, location: DeviceLocation) -> GuessedMode {
        let Some(device) = self.table.get(location) else { return GuessedMode::Undetermined };
        let num_configs = device.descriptor.num_configurations;
        if num_configs != 5 {
            return mode::classify_configuration_count(num_configs);
        }
        let Some(handle) = &device.handle else { return GuessedMode::Undetermined };
        match context::device_ref_from_handle(handle).config_descriptor_by_value(5) {
            Ok(cfg) => mode::classify_configuration_five(&cfg.interfaces),
            Err(_) => GuessedMode::Undetermined,
        }
    }

    fn submit_set_mode(&mut self, location: DeviceLocation, desired: u8) {
        let Some(device) = self.table.get(location) else { return };
        let Some(handle) = &device.handle else { return };
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::SetMode };
        let result = unsafe {
            transfer::submit_vendor_control_in(
                handle.as_ptr(),
                mode::SetModeRequest::REQUEST,
                mode::SetModeRequest::VALUE,
                desired as u16,
                mode::SetModeRequest::LENGTH,
                CONTROL_TRANSFER_TIMEOUT,
                control_trampoline::<C>,
                ctx,
            )
        };
        match result {
            Ok(xfer) => self.track(location, xfer.id(), TransferKind::Control),
            Err(code) => {
                self.collaborator.log(LogLevel::Warning, &format!("SET_MODE submit failed ({code})"));
                self.configure_device(location);
            }
        }
    }

    fn on_set_mode_complete(&mut self, location: DeviceLocation, status: TransferStatus, data: &[u8]) {
        if status.is_success() {
            let accepted = data.first().copied().map(mode::set_mode_accepted).unwrap_or(false);
            if !accepted {
                self.collaborator.log(LogLevel::Warning, "SET_MODE refused by device, continuing in current mode");
            }
        } else {
            self.collaborator.log(LogLevel::Warning, "SET_MODE did not complete, continuing in current mode");
        }
        if let Some(device) = self.table.get_mut(location) {
            device.state = DeviceState::Configuring;
        }
        self.configure_device(location);
    }

    fn configure_device(&mut self, location: DeviceLocation) {
        if let Some(device) = self.table.get_mut(location) {
            device.state = DeviceState::Configuring;
        }
        let selection = self.pick_interface_for(location);
        let Some(selection) = selection else {
            self.collaborator.log(LogLevel::Warning, &format!("no matching interface for {location:?}"));
            self.doom(location);
            return;
        };
        if let Err(e) = self.apply_configuration(location, &selection) {
            self.collaborator.log(LogLevel::Warning, &format!("configuration failed for {location:?}: {e}"));
            self.doom(location);
            return;
        }
        if let Some(device) = self.table.get_mut(location) {
            // wMaxPacketSize drives the bulk-out ZLP policy (spec.md §4.7),
            // so it's read from ep_out, matching the original's
            // `libusb_get_max_packet_size(dev, usbdev->ep_out)`.
            let max_packet_size = context::device_ref_from_handle(device.handle.as_ref().unwrap())
                .max_packet_size(selection.ep_out)
                .unwrap_or(crate::constants::DEFAULT_MAX_PACKET_SIZE);
            device.selection = Some(InterfaceSelection {
                interface_number: selection.interface_number,
                ep_in: selection.ep_in,
                ep_out: selection.ep_out,
                max_packet_size,
            });
            device.state = DeviceState::ReadingSerial;
        }
        self.begin_read_serial(location);
    }

    fn pick_interface_for(&self, location: DeviceLocation) -> Option<Selection> {
        let device = self.table.get(location)?;
        let handle = device.handle.as_ref()?;
        let dref = context::device_ref_from_handle(handle);
        let mut configs = Vec::with_capacity(device.descriptor.num_configurations as usize);
        for i in 0..device.descriptor.num_configurations {
            if let Ok(cfg) = dref.config_descriptor(i) {
                configs.push(cfg);
            }
        }
        config_select::pick_interface(&configs)
    }

    fn apply_configuration(&mut self, location: DeviceLocation, selection: &Selection) -> Result<(), UsbError> {
        let device = self.table.get(location).ok_or(UsbError::DeviceNotFound(location))?;
        let handle = device.handle.as_ref().ok_or(UsbError::DeviceNotFound(location))?;
        let dref = context::device_ref_from_handle(handle);
        let current = RawHandleOps::get_configuration(handle).unwrap_or(0);

        if config_select::needs_reconfigure(current, selection.configuration_value) {
            if let Ok(target_cfg) = dref.config_descriptor_by_value(selection.configuration_value) {
                for iface in &target_cfg.interfaces {
                    if let Err(e) = RawHandleOps::detach_kernel_driver_if_active(handle, iface.interface_number as c_int) {
                        self.collaborator.log(
                            LogLevel::Debug,
                            &format!("kernel driver detach check failed for interface {}: {e}", iface.interface_number),
                        );
                    }
                }
            }
            RawHandleOps::set_configuration(handle, selection.configuration_value as c_int)?;
        }
        RawHandleOps::claim_interface(handle, selection.interface_number as c_int)?;
        Ok(())
    }

    fn begin_read_serial(&mut self, location: DeviceLocation) {
        let Some(device) = self.table.get(location) else { return };
        let Some(handle) = &device.handle else { return };
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::GetLangId };
        let result = unsafe {
            transfer::submit_get_descriptor(
                handle.as_ptr(),
                serial::DESCRIPTOR_TYPE_STRING,
                0,
                0,
                255,
                CONTROL_TRANSFER_TIMEOUT,
                control_trampoline::<C>,
                ctx,
            )
        };
        match result {
            Ok(xfer) => self.track(location, xfer.id(), TransferKind::Control),
            Err(code) => {
                self.collaborator.log(LogLevel::Warning, &format!("language-id read failed ({code})"));
                self.doom(location);
            }
        }
    }

    fn on_get_langid_complete(&mut self, location: DeviceLocation, status: TransferStatus, data: &[u8]) {
        if !status.is_success() {
            self.collaborator.log(LogLevel::Warning, "language-id transfer did not complete");
            self.doom(location);
            return;
        }
        let Some(lang_id) = serial::primary_language_id(data) else {
            self.collaborator.log(LogLevel::Warning, "language-id response too short");
            self.doom(location);
            return;
        };
        let Some(device) = self.table.get(location) else { return };
        let Some(handle) = &device.handle else { return };
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::GetSerial { lang_id } };
        let serial_index = device.descriptor.serial_index;
        let result = unsafe {
            transfer::submit_get_descriptor(
                handle.as_ptr(),
                serial::DESCRIPTOR_TYPE_STRING,
                serial_index,
                lang_id,
                255,
                CONTROL_TRANSFER_TIMEOUT,
                control_trampoline::<C>,
                ctx,
            )
        };
        match result {
            Ok(xfer) => self.track(location, xfer.id(), TransferKind::Control),
            Err(code) => {
                self.collaborator.log(LogLevel::Warning, &format!("serial read failed ({code})"));
                self.doom(location);
            }
        }
    }

    fn on_get_serial_complete(&mut self, location: DeviceLocation, status: TransferStatus, data: &[u8]) {
        if !status.is_success() {
            self.collaborator.log(LogLevel::Warning, "serial transfer did not complete");
            self.doom(location);
            return;
        }
        let decoded = serial::decode(data);
        let info = {
            let Some(device) = self.table.get_mut(location) else { return };
            device.serial = Some(decoded);
            DeviceInfo::from(&*device)
        };
        if let Err(e) = self.collaborator.device_add(&info) {
            self.collaborator.log(LogLevel::Warning, &format!("device_add rejected {location:?}: {e}"));
            self.doom(location);
            return;
        }
        self.start_rx_loops(location);
    }

    fn start_rx_loops(&mut self, location: DeviceLocation) {
        let mut started = 0usize;
        for slot in 0..crate::bulk::target_rx_loops() {
            if self.submit_rx(location, slot).is_ok() {
                started += 1;
            }
        }
        match crate::bulk::classify_rx_startup(started) {
            crate::bulk::RxStartupOutcome::Fatal => {
                self.collaborator.log(LogLevel::Error, &format!("no read loop could start for {location:?}"));
                self.doom(location);
            }
            crate::bulk::RxStartupOutcome::Partial(n) => {
                self.collaborator.log(LogLevel::Warning, &format!("only {n} of {} read loops started for {location:?}", crate::bulk::target_rx_loops()));
                self.mark_live(location);
            }
            crate::bulk::RxStartupOutcome::Full => self.mark_live(location),
        }
    }

    fn mark_live(&mut self, location: DeviceLocation) {
        if let Some(device) = self.table.get_mut(location) {
            device.state = DeviceState::Live;
        }
    }

    fn submit_rx(&mut self, location: DeviceLocation, slot: usize) -> Result<(), ()> {
        let Some(device) = self.table.get(location) else { return Err(()) };
        let Some(handle) = &device.handle else { return Err(()) };
        let Some(selection) = device.selection else { return Err(()) };
        let buffer = vec![0u8; crate::bulk::read_buffer_size()].into_boxed_slice();
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::Rx { slot } };
        let result = unsafe { transfer::submit_bulk(handle.as_ptr(), selection.ep_in, buffer, bulk_trampoline::<C>, ctx) };
        match result {
            Ok(xfer) => {
                self.track(location, xfer.id(), TransferKind::Rx);
                Ok(())
            }
            Err((code, _buf)) => {
                self.collaborator.log(LogLevel::Warning, &format!("rx submit failed ({code})"));
                Err(())
            }
        }
    }

    fn on_rx_complete(&mut self, location: DeviceLocation, slot: usize, xfer: *mut libusb1_sys::libusb_transfer, status: TransferStatus, data: &[u8]) {
        let id = TransferId(xfer as usize);
        if status.is_success() {
            let Some(device) = self.table.get(location) else {
                // Table entry already gone (finalized): the device's
                // transfers should have been drained first, but don't leave
                // a stale registry entry pointing at a transfer we're about
                // to free either way.
                self.finish_transfer(location, id, TransferKind::Rx);
                unsafe { libusb1_sys::libusb_free_transfer(xfer) };
                return;
            };
            if device.is_doomed() {
                // Doomed before this read landed (device_remove already
                // fired) — don't hand the collaborator data for a device it
                // believes is gone.
                self.transfers.remove(id);
                if let Some(d) = self.table.get_mut(location) {
                    d.rx_transfers.remove(&id);
                }
                unsafe { libusb1_sys::libusb_free_transfer(xfer) };
                return;
            }
            self.collaborator.device_data_input(location, data);
            let buffer = vec![0u8; crate::bulk::read_buffer_size()].into_boxed_slice();
            let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::Rx { slot } };
            if unsafe { transfer::resubmit_bulk(xfer, buffer, ctx) }.is_err() {
                self.finish_transfer(location, id, TransferKind::Rx);
                unsafe { libusb1_sys::libusb_free_transfer(xfer) };
                self.doom(location);
            }
        } else {
            self.collaborator.log(transfer_log_level(status), &format!("rx transfer ended: {status:?}"));
            self.finish_transfer(location, id, TransferKind::Rx);
            unsafe { libusb1_sys::libusb_free_transfer(xfer) };
            self.doom(location);
        }
    }

    /// Submits `data` over the bulk-out endpoint, auto-appending a ZLP if
    /// needed (spec.md §4.7).
    pub fn send(&mut self, location: DeviceLocation, data: &[u8]) -> Result<(), UsbError> {
        let device = self.table.get(location).ok_or(UsbError::DeviceNotFound(location))?;
        let selection = device.selection.ok_or(UsbError::DeviceNotFound(location))?;
        let handle_ptr = device.handle.as_ref().ok_or(UsbError::DeviceNotFound(location))?.as_ptr();

        let buffer = data.to_vec().into_boxed_slice();
        let len = buffer.len();
        let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::Tx };
        let result = unsafe { transfer::submit_bulk(handle_ptr, selection.ep_out, buffer, bulk_trampoline::<C>, ctx) };
        let xfer = match result {
            Ok(xfer) => xfer,
            Err((code, _)) => return Err(UsbError::from_code(code)),
        };
        self.track(location, xfer.id(), TransferKind::Tx);

        if crate::bulk::needs_zlp(len, selection.max_packet_size) {
            let zlp = Vec::new().into_boxed_slice();
            let ctx = CallbackContext::<C> { manager: self as *mut Self, location, op: PendingOp::TxZlp };
            match unsafe { transfer::submit_bulk(handle_ptr, selection.ep_out, zlp, bulk_trampoline::<C>, ctx) } {
                Ok(zlp_xfer) => self.track(location, zlp_xfer.id(), TransferKind::Tx),
                Err((code, _)) => {
                    self.collaborator.log(LogLevel::Warning, &format!("ZLP submit failed ({code})"));
                }
            }
        }
        Ok(())
    }

    fn on_tx_complete(&mut self, location: DeviceLocation, xfer: *mut libusb1_sys::libusb_transfer, status: TransferStatus) {
        let id = TransferId(xfer as usize);
        self.finish_transfer(location, id, TransferKind::Tx);
        unsafe { libusb1_sys::libusb_free_transfer(xfer) };
        if !status.is_success() {
            self.collaborator.log(transfer_log_level(status), &format!("tx transfer ended: {status:?}"));
            self.doom(location);
        }
    }

    fn track(&mut self, location: DeviceLocation, id: usize, kind: TransferKind) {
        let tid = TransferId(id);
        self.transfers.insert(tid, location, kind);
        if let Some(device) = self.table.get_mut(location) {
            match kind {
                TransferKind::Rx => device.rx_transfers.insert(tid),
                TransferKind::Tx | TransferKind::Control => device.tx_transfers.insert(tid),
            };
        }
    }

    fn finish_transfer(&mut self, location: DeviceLocation, id: TransferId, kind: TransferKind) {
        self.transfers.remove(id);
        if let Some(device) = self.table.get_mut(location) {
            match kind {
                TransferKind::Rx => device.rx_transfers.remove(&id),
                TransferKind::Tx | TransferKind::Control => device.tx_transfers.remove(&id),
            };
        }
    }

    fn doom(&mut self, location: DeviceLocation) {
        let already_doomed = self.table.get(location).map(|d| d.is_doomed()).unwrap_or(true);
        if already_doomed {
            return;
        }
        self.begin_disconnect(location);
    }

    /// Per-device disconnect, step 1 of spec.md §4.9: cancel every
    /// outstanding transfer and mark the device doomed. The rest of the
    /// sequence (bounded drain, forced reclaim, teardown) happens in
    /// `drive_drains`, called from `process`/`process_timeout`/`shutdown`.
    fn begin_disconnect(&mut self, location: DeviceLocation) {
        let Some(device) = self.table.get_mut(location) else { return };
        if device.alive != AliveState::Doomed {
            device.doom();
            self.collaborator.device_remove(location);
        }
        for id in self.transfers.outstanding_for(location) {
            tracing::debug!(bus = location.bus, address = location.address, xfer = id.0, "cancelling outstanding transfer");
            unsafe { libusb1_sys::libusb_cancel_transfer(id.0 as *mut libusb1_sys::libusb_transfer) };
        }
        let now = self.collaborator.now();
        self.bookkeeping.entry(location).or_default().drain = Some(Drain::start(now));
    }

    /// Advances every in-progress disconnect (spec.md §4.9 steps 2-4).
    fn drive_drains(&mut self) {
        let doomed: Vec<DeviceLocation> = self.table.doomed_locations();
        let now = self.collaborator.now();
        for location in doomed {
            let outstanding = self.transfers.count_for(location);
            let Some(book) = self.bookkeeping.get(&location) else { continue };
            let Some(drain) = &book.drain else { continue };
            match drain.evaluate(now, outstanding) {
                DrainOutcome::Continue => {}
                DrainOutcome::Drained => self.finalize_device(location),
                DrainOutcome::ForceReclaim => {
                    self.collaborator.log(LogLevel::Warning, &format!("force-reclaiming {outstanding} leaked transfers for {location:?}"));
                    for id in self.transfers.outstanding_for(location) {
                        self.transfers.remove(id);
                        unsafe { libusb1_sys::libusb_free_transfer(id.0 as *mut libusb1_sys::libusb_transfer) };
                    }
                    if let Some(device) = self.table.get_mut(location) {
                        device.rx_transfers.clear();
                        device.tx_transfers.clear();
                    }
                    self.finalize_device(location);
                }
            }
        }
    }

    fn finalize_device(&mut self, location: DeviceLocation) {
        tracing::debug!(bus = location.bus, address = location.address, "finalizing device record");
        self.bookkeeping.remove(&location);
        let Some(mut device) = self.table.remove(location) else { return };
        if let Some(handle) = device.handle.take() {
            if let Some(selection) = device.selection {
                RawHandleOps::release_interface(&handle, selection.interface_number as c_int);
            }
            unsafe { handle.close() };
        }
    }

    /// Fills `out` with the fds libusb currently wants polled (spec.md §6
    /// `get_fds`).
    pub fn get_fds(&self, out: &mut Vec<PollFd>) {
        out.extend(self.context.poll_fds().into_iter().map(PollFd::from));
    }

    /// Smaller of libusb's own next timeout and the rediscovery deadline.
    /// When polling is disabled (`autodiscover(false)`), the rediscovery
    /// deadline is dropped from consideration entirely, matching
    /// `dev_poll_remain_ms`'s `if(!device_polling) return 100000` early-out
    /// (spec.md §4.8).
    pub fn get_timeout(&self) -> Duration {
        let now = self.collaborator.now();
        let rediscovery = if self.autodiscover_enabled { self.schedule.time_remaining(now) } else { None };
        crate::pump::next_timeout(self.context.next_timeout(), rediscovery)
    }

    /// Services ready events with zero timeout, drives drains, then runs
    /// rediscovery if due (spec.md §4.8).
    pub fn process(&mut self) -> Result<(), UsbError> {
        self.process_timeout(Duration::from_millis(0))
    }

    /// Bounded step: services events up to `timeout`, drives drains, then
    /// runs rediscovery if due (spec.md §4.8).
    pub fn process_timeout(&mut self, timeout: Duration) -> Result<(), UsbError> {
        self.context.handle_events_timeout(timeout)?;
        self.drive_drains();
        if self.autodiscover_enabled {
            let now = self.collaborator.now();
            if self.schedule.is_due(now) {
                self.discover()?;
                self.schedule.mark_ran(now);
            }
        }
        Ok(())
    }

    /// Toggles periodic polling and hotplug-arrival processing together
    /// (spec.md §6 `autodiscover`, mirroring the original's paired
    /// `device_polling`/`device_hotplug` flags). Hotplug departures are
    /// still processed regardless, matching `usb_hotplug_cb`'s unconditional
    /// `DEVICE_LEFT` handling.
    pub fn autodiscover(&mut self, enable: bool) {
        self.autodiscover_enabled = enable;
        self.hotplug_arrivals_enabled = enable;
    }

    pub fn serial(&self, location: DeviceLocation) -> Option<String> {
        self.table.get(location)?.serial.clone()
    }

    pub fn location(dev: DeviceLocation) -> u32 {
        dev.as_u32()
    }

    pub fn product_id(&self, location: DeviceLocation) -> Option<u16> {
        Some(self.table.get(location)?.descriptor.product_id)
    }

    pub fn speed(&self, location: DeviceLocation) -> Option<u64> {
        Some(self.table.get(location)?.speed.bits_per_second())
    }
}

/// Log level for a non-completed bulk transfer status, mirroring the
/// original's `tx_callback`/`rx_callback` switch verbatim (spec.md §7):
/// disconnect-shaped statuses (`Error`, `NoDevice`) are expected and logged
/// at info level, `Cancelled` is the normal teardown path and logged at
/// debug, everything else is an unexpected condition logged as an error.
fn transfer_log_level(status: TransferStatus) -> LogLevel {
    match status {
        TransferStatus::Error | TransferStatus::NoDevice => LogLevel::Info,
        TransferStatus::Cancelled => LogLevel::Debug,
        TransferStatus::TimedOut | TransferStatus::Stall | TransferStatus::Overflow => LogLevel::Error,
        TransferStatus::Completed => unreachable!("only called for non-completed statuses"),
    }
}

extern "C" fn control_trampoline<C: Collaborator>(xfer: *mut libusb1_sys::libusb_transfer) {
    let (ctx, status, data) = unsafe { transfer::on_control_complete::<CallbackContext<C>>(xfer) };
    let manager = unsafe { &mut *ctx.manager };
    // Every control submission is `track`ed into the registry and the
    // device's tx set before submission (spec.md §3 invariant 2); remove it
    // here, before freeing, so neither ever points at a freed transfer (the
    // same bookkeeping `on_tx_complete` does for bulk writes).
    manager.finish_transfer(ctx.location, TransferId(xfer as usize), TransferKind::Control);
    let completion = ControlCompletion { status, data: &data };
    match ctx.op {
        PendingOp::GetMode => manager.on_get_mode_complete(ctx.location, completion.status, completion.data),
        PendingOp::SetMode => manager.on_set_mode_complete(ctx.location, completion.status, completion.data),
        PendingOp::GetLangId => manager.on_get_langid_complete(ctx.location, completion.status, completion.data),
        PendingOp::GetSerial { .. } => manager.on_get_serial_complete(ctx.location, completion.status, completion.data),
        PendingOp::Rx { .. } | PendingOp::Tx | PendingOp::TxZlp => {
            unreachable!("control trampoline never carries a bulk op")
        }
    }
    unsafe { libusb1_sys::libusb_free_transfer(xfer) };
}

extern "C" fn bulk_trampoline<C: Collaborator>(xfer: *mut libusb1_sys::libusb_transfer) {
    let (ctx, status, data, actual) = unsafe { transfer::on_bulk_complete::<CallbackContext<C>>(xfer) };
    let manager = unsafe { &mut *ctx.manager };
    match ctx.op {
        PendingOp::Rx { slot } => {
            let completion = BulkCompletion { status, data: &data[..actual.min(data.len())] };
            manager.on_rx_complete(ctx.location, slot, xfer, completion.status, completion.data);
        }
        PendingOp::Tx | PendingOp::TxZlp => manager.on_tx_complete(ctx.location, xfer, status),
        PendingOp::GetMode | PendingOp::SetMode | PendingOp::GetLangId | PendingOp::GetSerial { .. } => {
            unreachable!("bulk trampoline never carries a control op")
        }
    }
}

/// Hotplug callback (spec.md §4.8: "must perform no blocking work").
/// Arrivals route to the same negotiation path as a poll discovery;
/// departures doom the matching record.
extern "C" fn hotplug_trampoline<C: Collaborator>(
    _ctx: *mut libusb1_sys::libusb_context,
    device: *mut libusb1_sys::libusb_device,
    event: libusb1_sys::libusb_hotplug_event,
    user_data: *mut c_void,
) -> c_int {
    let manager = unsafe { &mut *(user_data as *mut Manager<C>) };
    let dref = context::device_ref_from_hotplug(device);
    let location = DeviceLocation::new(dref.bus_number(), dref.device_address());

    if event == libusb1_sys::constants::LIBUSB_HOTPLUG_EVENT_DEVICE_LEFT {
        manager.doom(location);
        return 0;
    }

    if !manager.hotplug_arrivals_enabled {
        return 0;
    }
    if manager.table.contains(location) {
        return 0;
    }
    let descriptor = match dref.descriptor() {
        Ok(d) => d,
        Err(_) => return 0,
    };
    if !crate::enumeration::is_candidate(&descriptor) {
        return 0;
    }
    let speed = dref.speed();
    // Valid for the duration of this callback only (libusb's documented
    // hotplug contract); `open()` below is synchronous, so no `upgrade()`
    // dance is needed the way `discover()`'s deferred processing requires.
    match dref.open() {
        Ok(handle) => manager.begin_negotiation(location, descriptor, speed, handle),
        Err(e) => manager.collaborator.log(LogLevel::Warning, &format!("hotplug open failed for {location:?}: {e}")),
    }
    0
}
