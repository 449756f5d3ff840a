//! Configuration selector (C5): picks the configuration whose interface
//! exposes the multiplexer class/subclass/protocol and its two bulk
//! endpoints (spec.md §4.5).

use crate::constants::{INTERFACE_CLASS, INTERFACE_PROTOCOL, INTERFACE_SUBCLASS};
use crate::ffi::{ConfigDescriptor, EndpointDescriptor, InterfaceDescriptor};

#[derive(Debug, Clone, Copy)]
pub struct Selection {
    pub configuration_value: u8,
    pub interface_number: u8,
    pub ep_out: u8,
    pub ep_in: u8,
}

fn matches_multiplexer(iface: &InterfaceDescriptor) -> bool {
    iface.class == INTERFACE_CLASS || iface.subclass == INTERFACE_SUBCLASS || iface.protocol == INTERFACE_PROTOCOL
}

/// Assigns ep_out/ep_in from a two-endpoint interface, accepting either
/// discovery order (spec.md §4.5: "ep[0]=OUT & ep[1]=IN first, else
/// ep[1]=OUT & ep[0]=IN"). `None` if the pair isn't opposite-direction.
fn assign_endpoints(endpoints: &[EndpointDescriptor]) -> Option<(u8, u8)> {
    if endpoints.len() != 2 {
        return None;
    }
    let (a, b) = (endpoints[0], endpoints[1]);
    if !a.is_in() && b.is_in() {
        Some((a.address, b.address))
    } else if !b.is_in() && a.is_in() {
        Some((b.address, a.address))
    } else {
        None
    }
}

/// Picks the first interface, scanning configurations from the highest
/// `bConfigurationValue` down and interfaces within a configuration in
/// ascending order, whose altsetting 0 disjunctively matches the
/// multiplexer triple and has exactly two opposite-direction endpoints
/// (spec.md §4.5, SPEC_FULL.md §4's scan-order clarification). Pure over
/// already-read descriptor data, so it's testable without libusb.
pub fn pick_interface(configs: &[ConfigDescriptor]) -> Option<Selection> {
    let mut ordered: Vec<&ConfigDescriptor> = configs.iter().collect();
    ordered.sort_by(|a, b| b.configuration_value.cmp(&a.configuration_value));

    for config in ordered {
        for iface in &config.interfaces {
            if !matches_multiplexer(iface) {
                continue;
            }
            match assign_endpoints(&iface.endpoints) {
                Some((ep_out, ep_in)) => {
                    return Some(Selection {
                        configuration_value: config.configuration_value,
                        interface_number: iface.interface_number,
                        ep_out,
                        ep_in,
                    });
                }
                None => continue, // "endpoint type mismatch" — keep scanning.
            }
        }
    }
    None
}

/// Whether changing to `target` configuration requires a reconfigure
/// (spec.md §4.5: "currently active configuration differs... or is
/// zero").
pub fn needs_reconfigure(current_configuration_value: i32, target: u8) -> bool {
    current_configuration_value == 0 || current_configuration_value != target as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8) -> EndpointDescriptor {
        EndpointDescriptor { address, max_packet_size: 512 }
    }

    fn mux_iface(interface_number: u8, endpoints: Vec<EndpointDescriptor>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            interface_number,
            class: INTERFACE_CLASS,
            subclass: INTERFACE_SUBCLASS,
            protocol: INTERFACE_PROTOCOL,
            endpoints,
        }
    }

    #[test]
    fn picks_highest_configuration_with_a_matching_interface() {
        let configs = vec![
            ConfigDescriptor {
                configuration_value: 1,
                interfaces: vec![mux_iface(0, vec![ep(0x01), ep(0x81)])],
            },
            ConfigDescriptor {
                configuration_value: 4,
                interfaces: vec![mux_iface(2, vec![ep(0x02), ep(0x82)])],
            },
        ];
        let picked = pick_interface(&configs).unwrap();
        assert_eq!(picked.configuration_value, 4);
        assert_eq!(picked.interface_number, 2);
        assert_eq!(picked.ep_out, 0x02);
        assert_eq!(picked.ep_in, 0x82);
    }

    #[test]
    fn accepts_either_endpoint_discovery_order() {
        let configs = vec![ConfigDescriptor {
            configuration_value: 1,
            interfaces: vec![mux_iface(0, vec![ep(0x81), ep(0x01)])],
        }];
        let picked = pick_interface(&configs).unwrap();
        assert_eq!(picked.ep_out, 0x01);
        assert_eq!(picked.ep_in, 0x81);
    }

    #[test]
    fn disjunctive_match_on_subclass_alone() {
        let configs = vec![ConfigDescriptor {
            configuration_value: 1,
            interfaces: vec![InterfaceDescriptor {
                interface_number: 0,
                class: 0x00,
                subclass: INTERFACE_SUBCLASS,
                protocol: 0x00,
                endpoints: vec![ep(0x01), ep(0x81)],
            }],
        }];
        assert!(pick_interface(&configs).is_some());
    }

    #[test]
    fn same_direction_pair_is_rejected_and_scan_continues() {
        let configs = vec![ConfigDescriptor {
            configuration_value: 1,
            interfaces: vec![
                mux_iface(0, vec![ep(0x01), ep(0x02)]),
                mux_iface(1, vec![ep(0x03), ep(0x83)]),
            ],
        }];
        let picked = pick_interface(&configs).unwrap();
        assert_eq!(picked.interface_number, 1);
    }

    #[test]
    fn no_matching_interface_returns_none() {
        let configs = vec![ConfigDescriptor {
            configuration_value: 1,
            interfaces: vec![InterfaceDescriptor {
                interface_number: 0,
                class: 0x09,
                subclass: 0x00,
                protocol: 0x00,
                endpoints: vec![ep(0x01), ep(0x81)],
            }],
        }];
        assert!(pick_interface(&configs).is_none());
    }

    #[test]
    fn reconfigure_needed_when_current_is_zero_or_different() {
        assert!(needs_reconfigure(0, 4));
        assert!(needs_reconfigure(1, 4));
        assert!(!needs_reconfigure(4, 4));
    }
}
