//! Mode negotiator (C4): get-mode, guess-mode, optional switch-mode
//! (spec.md §4.4).

use crate::constants::{
    APPLE_VEND_SPECIFIC_GET_MODE, APPLE_VEND_SPECIFIC_SET_MODE, CDC_NCM_CLASS, CDC_NCM_SUBCLASS,
    INTERFACE_CLASS, INTERFACE_PROTOCOL, INTERFACE_SUBCLASS, VALERIA_PROTOCOL, VALERIA_SUBCLASS,
};
use crate::ffi::InterfaceDescriptor;

/// The guessed operating mode of a device, derived from its configuration
/// count (and, for five configurations, configuration 5's interface set).
/// Numeric values mirror the original's `guess_mode` return codes (spec.md
/// is implementation-silent on the numbering; `original_source/src/usb.c`
/// is not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessedMode {
    /// `guess_mode() == 0`: never switched to.
    Undetermined,
    /// `1`
    Initial,
    /// `2`
    Valeria,
    /// `3`
    CdcNcm,
    /// `4`
    UsbEthAndCdcNcm,
    /// `5`
    CdcNcmDirect,
}

impl GuessedMode {
    pub fn as_request_value(self) -> Option<u8> {
        match self {
            GuessedMode::Undetermined => None,
            GuessedMode::Initial => Some(1),
            GuessedMode::Valeria => Some(2),
            GuessedMode::CdcNcm => Some(3),
            GuessedMode::UsbEthAndCdcNcm => Some(4),
            GuessedMode::CdcNcmDirect => Some(5),
        }
    }

    pub fn from_request_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(GuessedMode::Initial),
            2 => Some(GuessedMode::Valeria),
            3 => Some(GuessedMode::CdcNcm),
            4 => Some(GuessedMode::UsbEthAndCdcNcm),
            5 => Some(GuessedMode::CdcNcmDirect),
            _ => None,
        }
    }
}

/// Classifies a device purely from its configuration count (spec.md §4.4
/// step 2, the configurations 1/2-4/6 cases; configuration 5 needs the
/// interface list and goes through `classify_configuration_five`).
pub fn classify_configuration_count(num_configurations: u8) -> GuessedMode {
    match num_configurations {
        1 => GuessedMode::CdcNcmDirect,
        2..=4 => GuessedMode::Initial,
        6 => GuessedMode::UsbEthAndCdcNcm,
        _ => GuessedMode::Undetermined,
    }
}

fn has_multiplexer_interface(interfaces: &[InterfaceDescriptor]) -> bool {
    interfaces
        .iter()
        .any(|i| i.class == INTERFACE_CLASS || i.subclass == INTERFACE_SUBCLASS || i.protocol == INTERFACE_PROTOCOL)
}

fn has_valeria_interface(interfaces: &[InterfaceDescriptor]) -> bool {
    interfaces
        .iter()
        .any(|i| i.class == INTERFACE_CLASS && i.subclass == VALERIA_SUBCLASS && i.protocol == VALERIA_PROTOCOL)
}

fn has_cdc_ncm_interface(interfaces: &[InterfaceDescriptor]) -> bool {
    interfaces
        .iter()
        .any(|i| i.class == CDC_NCM_CLASS && i.subclass == CDC_NCM_SUBCLASS)
}

/// Classifies configuration 5 by inspecting its interface set (spec.md
/// §4.4 step 2's five-configuration case). `interfaces` is configuration
/// 5's altsetting-0 interface list, or this function would not have been
/// called — an unreadable configuration 5 is handled by the caller as
/// `Undetermined` without ever reaching here (SPEC_FULL.md §9).
pub fn classify_configuration_five(interfaces: &[InterfaceDescriptor]) -> GuessedMode {
    let has_mux = has_multiplexer_interface(interfaces);
    if has_mux && has_valeria_interface(interfaces) {
        GuessedMode::Valeria
    } else if has_mux && has_cdc_ncm_interface(interfaces) {
        GuessedMode::CdcNcm
    } else {
        GuessedMode::Undetermined
    }
}

/// Whether a switch should be attempted at all: the guess must be
/// determined and differ from the desired mode (spec.md §4.4 step 4, the
/// conjunction exactly matching the original's `get_mode_cb` guard).
pub fn should_switch(guessed: GuessedMode, desired_value: u8) -> bool {
    match guessed.as_request_value() {
        Some(v) => v != desired_value,
        None => false,
    }
}

/// Vendor-specific `GET_MODE`/`SET_MODE` request parameters (spec.md §6).
pub struct GetModeRequest;

impl GetModeRequest {
    pub const REQUEST: u8 = APPLE_VEND_SPECIFIC_GET_MODE;
    pub const LENGTH: u16 = 4;
}

pub struct SetModeRequest;

impl SetModeRequest {
    pub const REQUEST: u8 = APPLE_VEND_SPECIFIC_SET_MODE;
    pub const VALUE: u16 = 0;
    pub const LENGTH: u16 = 1;
}

/// Interprets a `SET_MODE` response byte: zero means accepted, anything
/// else is a refusal that initialization tolerates (spec.md §4.4 step 4).
pub fn set_mode_accepted(response_byte: u8) -> bool {
    response_byte == 0
}

/// State threaded through the get-mode -> switch-mode callback chain,
/// owned end-to-end by the dispatcher (SPEC_FULL.md §9's resolution of the
/// `mode_context` ownership open question).
pub struct ModeNegotiation {
    pub desired: u8,
    pub guessed: GuessedMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(class: u8, subclass: u8, protocol: u8) -> InterfaceDescriptor {
        InterfaceDescriptor {
            interface_number: 0,
            class,
            subclass,
            protocol,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn single_configuration_is_cdc_ncm_direct() {
        assert_eq!(classify_configuration_count(1), GuessedMode::CdcNcmDirect);
    }

    #[test]
    fn two_to_four_configurations_are_initial() {
        assert_eq!(classify_configuration_count(2), GuessedMode::Initial);
        assert_eq!(classify_configuration_count(3), GuessedMode::Initial);
        assert_eq!(classify_configuration_count(4), GuessedMode::Initial);
    }

    #[test]
    fn six_configurations_is_usbeth_and_cdc_ncm() {
        assert_eq!(classify_configuration_count(6), GuessedMode::UsbEthAndCdcNcm);
    }

    #[test]
    fn five_configurations_with_valeria_and_mux_interfaces() {
        let interfaces = vec![
            iface(INTERFACE_CLASS, INTERFACE_SUBCLASS, INTERFACE_PROTOCOL),
            iface(0xff, VALERIA_SUBCLASS, VALERIA_PROTOCOL),
        ];
        assert_eq!(classify_configuration_five(&interfaces), GuessedMode::Valeria);
    }

    #[test]
    fn five_configurations_with_cdc_ncm_and_mux_interfaces() {
        let interfaces = vec![
            iface(INTERFACE_CLASS, INTERFACE_SUBCLASS, INTERFACE_PROTOCOL),
            iface(CDC_NCM_CLASS, CDC_NCM_SUBCLASS, 0),
        ];
        assert_eq!(classify_configuration_five(&interfaces), GuessedMode::CdcNcm);
    }

    #[test]
    fn five_configurations_with_neither_companion_is_undetermined() {
        let interfaces = vec![iface(INTERFACE_CLASS, INTERFACE_SUBCLASS, INTERFACE_PROTOCOL)];
        assert_eq!(classify_configuration_five(&interfaces), GuessedMode::Undetermined);
    }

    #[test]
    fn switch_skipped_when_guess_is_undetermined() {
        assert!(!should_switch(GuessedMode::Undetermined, 2));
    }

    #[test]
    fn switch_skipped_when_guess_matches_desired() {
        assert!(!should_switch(GuessedMode::Initial, 1));
    }

    #[test]
    fn switch_attempted_when_guess_differs_from_desired() {
        assert!(should_switch(GuessedMode::Initial, 2));
    }

    #[test]
    fn set_mode_response_interpretation() {
        assert!(set_mode_accepted(0));
        assert!(!set_mode_accepted(1));
    }
}
