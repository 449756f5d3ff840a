//! Descriptor readout: turns libusb's pointer-and-length descriptor structs
//! into owned, `'static` Rust values so the rest of the crate never has to
//! reason about descriptor pointer lifetimes.

use crate::device::DeviceDescriptor;
use crate::error::UsbError;
use std::os::raw::c_int;

#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// High bit of `bEndpointAddress`: set means IN (device-to-host).
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub configuration_value: u8,
    /// First alt-setting of each interface only — this crate, like the
    /// original, never looks past altsetting 0 (spec.md §4.5).
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Reads `libusb_device_descriptor` into the crate's cached copy.
///
/// # Safety
/// `device` must be a valid, referenced `libusb_device*`.
pub(crate) unsafe fn read_device_descriptor(
    device: *mut libusb1_sys::libusb_device,
) -> Result<DeviceDescriptor, UsbError> {
    let mut raw: libusb1_sys::libusb_device_descriptor = std::mem::zeroed();
    let rc = unsafe { libusb1_sys::libusb_get_device_descriptor(device, &mut raw) };
    if rc != 0 {
        return Err(UsbError::from_code(rc));
    }
    Ok(DeviceDescriptor {
        vendor_id: raw.idVendor,
        product_id: raw.idProduct,
        bcd_device: raw.bcdDevice,
        num_configurations: raw.bNumConfigurations,
        serial_index: raw.iSerialNumber,
    })
}

/// Reads the configuration descriptor with the given `bConfigurationValue`
/// (not positional index — mirrors `libusb_get_config_descriptor_by_value`,
/// used by both the mode guesser and the configuration selector).
///
/// # Safety
/// `device` must be a valid, referenced `libusb_device*`.
pub(crate) unsafe fn read_config_descriptor_by_value(
    device: *mut libusb1_sys::libusb_device,
    configuration_value: u8,
) -> Result<ConfigDescriptor, UsbError> {
    let mut raw: *const libusb1_sys::libusb_config_descriptor = std::ptr::null();
    let rc = unsafe {
        libusb1_sys::libusb_get_config_descriptor_by_value(device, configuration_value, &mut raw)
    };
    if rc != 0 || raw.is_null() {
        return Err(UsbError::from_code(rc));
    }
    let owned = unsafe { copy_config_descriptor(raw) };
    unsafe { libusb1_sys::libusb_free_config_descriptor(raw) };
    Ok(owned)
}

/// Reads the configuration descriptor at the given zero-based index.
///
/// # Safety
/// `device` must be a valid, referenced `libusb_device*`.
pub(crate) unsafe fn read_config_descriptor(
    device: *mut libusb1_sys::libusb_device,
    index: u8,
) -> Result<ConfigDescriptor, UsbError> {
    let mut raw: *const libusb1_sys::libusb_config_descriptor = std::ptr::null();
    let rc = unsafe { libusb1_sys::libusb_get_config_descriptor(device, index, &mut raw) };
    if rc != 0 || raw.is_null() {
        return Err(UsbError::from_code(rc));
    }
    let owned = unsafe { copy_config_descriptor(raw) };
    unsafe { libusb1_sys::libusb_free_config_descriptor(raw) };
    Ok(owned)
}

/// # Safety
/// `raw` must point at a valid, still-owned `libusb_config_descriptor`.
unsafe fn copy_config_descriptor(
    raw: *const libusb1_sys::libusb_config_descriptor,
) -> ConfigDescriptor {
    let cfg = unsafe { &*raw };
    let mut interfaces = Vec::with_capacity(cfg.bNumInterfaces as usize);

    for i in 0..cfg.bNumInterfaces as isize {
        let iface = unsafe { &*cfg.interface.offset(i) };
        if iface.num_altsetting <= 0 {
            continue;
        }
        // Only altsetting 0, matching the original's `altsetting[0]` reads.
        let alt = unsafe { &*iface.altsetting };
        let mut endpoints = Vec::with_capacity(alt.bNumEndpoints as usize);
        for e in 0..alt.bNumEndpoints as isize {
            let ep = unsafe { &*alt.endpoint.offset(e) };
            endpoints.push(EndpointDescriptor {
                address: ep.bEndpointAddress,
                max_packet_size: ep.wMaxPacketSize,
            });
        }
        interfaces.push(InterfaceDescriptor {
            interface_number: alt.bInterfaceNumber,
            class: alt.bInterfaceClass,
            subclass: alt.bInterfaceSubClass,
            protocol: alt.bInterfaceProtocol,
            endpoints,
        });
    }

    ConfigDescriptor {
        configuration_value: cfg.bConfigurationValue,
        interfaces,
    }
}

/// # Safety
/// `handle` must be a valid, open `libusb_device_handle*`.
pub(crate) unsafe fn get_configuration(
    handle: *mut libusb1_sys::libusb_device_handle,
) -> Result<c_int, UsbError> {
    let mut current: c_int = 0;
    let rc = unsafe { libusb1_sys::libusb_get_configuration(handle, &mut current) };
    if rc != 0 {
        return Err(UsbError::from_code(rc));
    }
    Ok(current)
}

/// # Safety
/// `device`/`ep_addr` must name an endpoint on a device still plugged in.
pub(crate) unsafe fn max_packet_size(
    device: *mut libusb1_sys::libusb_device,
    ep_addr: u8,
) -> Option<u16> {
    let size = unsafe { libusb1_sys::libusb_get_max_packet_size(device, ep_addr) };
    if size <= 0 {
        None
    } else {
        Some(size as u16)
    }
}
