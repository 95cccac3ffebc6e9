//! Network primitives shared by the EVPN gateway crates.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses (router MACs, neighbor and FDB MACs)
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers of logical bridges
//! - [`Vni`]: 24-bit VXLAN network identifiers

mod mac;
mod vlan;

pub use mac::MacAddress;
pub use vlan::{VlanId, Vni};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(String),

    #[error("invalid VNI: {0} (must be 1-16777215)")]
    InvalidVni(String),
}
