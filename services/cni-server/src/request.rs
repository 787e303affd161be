//! Decoding forwarded CNI invocations.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ovnk_cni_types::{CniRequest, NetConf, TypesError};
use thiserror::Error;

/// Errors from decoding a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("unsupported CNI command {0:?}")]
    UnsupportedCommand(String),

    #[error("invalid network configuration: {0}")]
    Config(#[from] TypesError),
}

/// CNI operation requested by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
}

impl FromStr for Command {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            other => Err(RequestError::UnsupportedCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
            Self::Check => "CHECK",
        })
    }
}

/// One sandbox's network setup or teardown ask.
#[derive(Debug, Clone)]
pub struct PodRequest {
    pub command: Command,
    pub sandbox_id: String,

    /// Network namespace path; may be empty on DEL.
    pub netns: PathBuf,

    pub ifname: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub conf: NetConf,
}

impl PodRequest {
    /// Decode a forwarded invocation.
    ///
    /// DEL only needs the sandbox ID, since the runtime may call it after the
    /// namespace is gone.
    pub fn from_cni(req: &CniRequest) -> Result<Self, RequestError> {
        let env = &req.env;
        let get = |key: &'static str| env.get(key).map(String::as_str).unwrap_or_default();
        let require = |key: &'static str| match get(key) {
            "" => Err(RequestError::Missing(key)),
            value => Ok(value.to_string()),
        };

        let command: Command = require("CNI_COMMAND")?.parse()?;
        let sandbox_id = require("CNI_CONTAINERID")?;
        let args = parse_cni_args(get("CNI_ARGS"));
        let conf = NetConf::from_bytes(&req.config)?;

        let pod = |key: &'static str| args.get(key).cloned().unwrap_or_default();
        let mut request = Self {
            command,
            sandbox_id,
            netns: PathBuf::from(get("CNI_NETNS")),
            ifname: get("CNI_IFNAME").to_string(),
            pod_namespace: pod("K8S_POD_NAMESPACE"),
            pod_name: pod("K8S_POD_NAME"),
            conf,
        };

        if command == Command::Add {
            if request.netns.as_os_str().is_empty() {
                return Err(RequestError::Missing("CNI_NETNS"));
            }
            if request.ifname.is_empty() {
                return Err(RequestError::Missing("CNI_IFNAME"));
            }
            if request.pod_namespace.is_empty() {
                return Err(RequestError::Missing("K8S_POD_NAMESPACE in CNI_ARGS"));
            }
            if request.pod_name.is_empty() {
                return Err(RequestError::Missing("K8S_POD_NAME in CNI_ARGS"));
            }
        } else if request.ifname.is_empty() {
            request.ifname = "eth0".to_string();
        }

        Ok(request)
    }
}

/// Split `CNI_ARGS` (`K=V;K=V`) into a map.
fn parse_cni_args(args: &str) -> HashMap<String, String> {
    args.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
