//! Shared types for the node CNI provisioning engine.
//!
//! This library provides:
//! - Hardware and IP address value types (`MacAddr`, `IpCidr`)
//! - CNI network configuration and result documents
//! - The shim/server control protocol (`CniRequest`, `CniResponse`)
//! - The pod network annotation written by the cluster controller
//! - Interface naming rules shared by setup and teardown

use thiserror::Error;

mod addr;
mod annotation;
mod cni;
mod protocol;

pub use addr::{IpCidr, MacAddr};
pub use annotation::{PodAnnotation, POD_NETWORK_ANNOTATION};
pub use cni::{
    CniErrorReply, CniResult, Dns, IpConfig, NetConf, ResultInterface, Route, VersionReply,
    SUPPORTED_VERSIONS,
};
pub use protocol::{env_map, CniRequest, CniResponse};

/// Errors from parsing shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Invalid hardware address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u32, min: u32, max: u32 },

    /// Malformed JSON document.
    #[error("malformed {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Interface naming
// ============================================================================

/// Kernel interface name buffer size, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Longest usable interface name.
pub const MAX_IFNAME_LEN: usize = IFNAMSIZ - 1;

/// Host-side interface name for a sandbox.
///
/// Derived only from the sandbox ID so teardown can recompute it without
/// stored state. Both the veth host end and a renamed VF representor use it.
pub fn host_interface_name(sandbox_id: &str) -> String {
    truncate_name(sandbox_id, MAX_IFNAME_LEN).to_string()
}

/// Temporary name for the sandbox end while it crosses namespaces.
///
/// Prefixed so it can never collide with a host-side name, and keyed by the
/// sandbox ID so concurrent requests never share a placeholder.
pub fn placeholder_name(sandbox_id: &str) -> String {
    format!("tmp{}", truncate_name(sandbox_id, MAX_IFNAME_LEN - 3))
}

fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU for IPv4.
pub const MTU_MIN_IPV4: u32 = 576;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u32 = 9000;

/// Default pod MTU (overlay encapsulation leaves 100 bytes of headroom).
pub const MTU_DEFAULT_POD: u32 = 1400;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u32) -> Result<u32, TypesError> {
    if !(MTU_MIN_IPV4..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(TypesError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV4,
            max: MTU_MAX_JUMBO,
        });
    }
    Ok(mtu)
}
