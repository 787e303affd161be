//! CNI network configuration and result documents.
//!
//! Only the fields this plugin reads or emits are modelled; unknown
//! configuration keys are ignored.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{IpCidr, TypesError};

/// CNI specification versions this plugin can answer in.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Network configuration delivered on the plugin's stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConf {
    /// Requested CNI result version.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    /// Network name.
    #[serde(default)]
    pub name: String,

    /// Plugin type.
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// PCI address of an SR-IOV virtual function to hand to the pod.
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Per-network MTU override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl NetConf {
    /// Parse the raw stdin configuration.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(|source| TypesError::Json {
            what: "network configuration",
            source,
        })
    }

    /// Hardware device requested for the pod, ignoring empty strings.
    pub fn device(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|d| !d.is_empty())
    }
}

/// An interface entry in a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInterface {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,

    /// Network namespace path; empty for host-side interfaces.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

/// An IP configuration entry in a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address family; only emitted for pre-1.0 results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Index into the result's interface list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,

    pub address: IpCidr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// A route entry in a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpCidr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// DNS settings in a CNI result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Successful ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    #[serde(default)]
    pub interfaces: Vec<ResultInterface>,

    #[serde(default)]
    pub ips: Vec<IpConfig>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub dns: Dns,
}

impl CniResult {
    /// Build a result for a single interface address.
    ///
    /// `interfaces` lists host side first, sandbox side second; the address is
    /// attached to the sandbox side. Routes and DNS are left empty.
    pub fn single_address(
        cni_version: &str,
        interfaces: Vec<ResultInterface>,
        address: IpCidr,
        gateway: IpAddr,
    ) -> Self {
        let interface = interfaces.len().checked_sub(1);
        // CNI 1.0 dropped the per-address version field.
        let version = if cni_version.starts_with("0.") || cni_version.is_empty() {
            Some(address.family().to_string())
        } else {
            None
        };

        Self {
            cni_version: cni_version.to_string(),
            interfaces,
            ips: vec![IpConfig {
                version,
                interface,
                address,
                gateway: Some(gateway),
            }],
            routes: Vec::new(),
            dns: Dns::default(),
        }
    }
}

/// Error document printed by the plugin on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    pub code: u32,

    pub msg: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniErrorReply {
    /// Code used for all plugin-specific failures.
    pub const PLUGIN_FAILURE: u32 = 100;

    pub fn new(cni_version: &str, msg: impl Into<String>) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: Self::PLUGIN_FAILURE,
            msg: msg.into(),
            details: String::new(),
        }
    }
}

/// Reply to the VERSION command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionReply {
    fn default() -> Self {
        let latest = SUPPORTED_VERSIONS.last().copied().unwrap_or("1.0.0");
        Self {
            cni_version: latest.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
