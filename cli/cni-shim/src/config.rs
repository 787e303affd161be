//! Shim configuration.
//!
//! The plugin is exec'd by the container runtime with a fixed CNI
//! environment, so the only knobs are environment variables.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ovnk_cni_types::env_map;

use crate::client::Endpoint;

/// Well-known control socket of the node CNI server.
pub const DEFAULT_SOCKET: &str = "/var/run/ovn-kubernetes/cni/ovn-cni-server.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "OVNK_CNI_SOCKET";

/// Environment variable selecting a TCP endpoint instead.
pub const TCP_ENV: &str = "OVNK_CNI_TCP";

/// The process environment as `KEY=VALUE` entries.
///
/// Entries that are not valid UTF-8 are converted lossily rather than
/// aborting the plugin.
pub fn process_env() -> Vec<String> {
    std::env::vars_os()
        .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
        .collect()
}

/// Shim configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    pub endpoint: Endpoint,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET)),
        }
    }
}

impl ShimConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&env_map(process_env()))
    }

    /// Load from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let non_empty = |key: &str| vars.get(key).filter(|v| !v.is_empty());

        if let Some(addr) = non_empty(TCP_ENV) {
            let addr = addr
                .parse()
                .with_context(|| format!("invalid {TCP_ENV} address {addr:?}"))?;
            return Ok(Self {
                endpoint: Endpoint::Tcp(addr),
            });
        }

        Ok(match non_empty(SOCKET_ENV) {
            Some(path) => Self {
                endpoint: Endpoint::Unix(PathBuf::from(path)),
            },
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_socket() {
        let config = ShimConfig::from_vars(&vars(&[])).unwrap();
        assert_eq!(config.endpoint, Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET)));
    }

    #[test]
    fn test_socket_override() {
        let config = ShimConfig::from_vars(&vars(&[(SOCKET_ENV, "/tmp/cni.sock")])).unwrap();
        assert_eq!(config.endpoint, Endpoint::Unix(PathBuf::from("/tmp/cni.sock")));
    }

    #[test]
    fn test_tcp_wins() {
        let config = ShimConfig::from_vars(&vars(&[
            (SOCKET_ENV, "/tmp/cni.sock"),
            (TCP_ENV, "127.0.0.1:3996"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, Endpoint::Tcp("127.0.0.1:3996".parse().unwrap()));
    }

    #[test]
    fn test_bad_tcp_address() {
        assert!(ShimConfig::from_vars(&vars(&[(TCP_ENV, "nope")])).is_err());
    }
}
