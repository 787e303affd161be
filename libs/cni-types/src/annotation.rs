//! Pod network annotation written by the cluster controller.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{IpCidr, MacAddr, TypesError};

/// Annotation key holding the pod's assigned network identity.
pub const POD_NETWORK_ANNOTATION: &str = "ovn";

/// Network identity assigned to a pod.
///
/// Stored as JSON under [`POD_NETWORK_ANNOTATION`], for example
/// `{"ip_address":"10.1.2.3/24","mac_address":"0a:00:00:00:00:01","gateway_ip":"10.1.2.1"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAnnotation {
    /// Address and prefix for the pod interface.
    #[serde(rename = "ip_address")]
    pub ip: IpCidr,

    /// Hardware address for the pod interface.
    #[serde(rename = "mac_address")]
    pub mac: MacAddr,

    /// Default gateway.
    #[serde(rename = "gateway_ip")]
    pub gateway: IpAddr,
}

impl PodAnnotation {
    /// Decode the annotation value.
    pub fn from_json(value: &str) -> Result<Self, TypesError> {
        serde_json::from_str(value).map_err(|source| TypesError::Json {
            what: "pod network annotation",
            source,
        })
    }
}
