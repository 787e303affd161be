//! Configuration for the CNI server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use ovnk_cni_types::{validate_mtu, MTU_DEFAULT_POD};

/// Well-known control socket the shim connects to.
pub const DEFAULT_SOCKET: &str = "/var/run/ovn-kubernetes/cni/ovn-cni-server.sock";

/// Node CNI server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "ovnk-cni-server", version, about = "Node-local CNI server")]
pub struct Config {
    /// Unix socket to serve the control protocol on.
    #[arg(long, env = "OVNK_CNI_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Serve over TCP instead of the Unix socket.
    #[arg(long, env = "OVNK_CNI_TCP")]
    pub listen_tcp: Option<SocketAddr>,

    /// Integration bridge pod ports are attached to.
    #[arg(long, env = "OVNK_BRIDGE", default_value = "br-int")]
    pub bridge: String,

    /// Default pod interface MTU.
    #[arg(long, env = "OVNK_MTU", default_value_t = MTU_DEFAULT_POD)]
    pub mtu: u32,

    /// Kubernetes API server URL.
    #[arg(long, env = "OVNK_KUBE_API", default_value = "https://kubernetes.default.svc")]
    pub kube_api: String,

    /// Bearer token file for the API server.
    #[arg(
        long,
        env = "OVNK_KUBE_TOKEN_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub kube_token_file: Option<PathBuf>,

    /// CA bundle for the API server.
    #[arg(long, env = "OVNK_KUBE_CA_FILE")]
    pub kube_ca_file: Option<PathBuf>,

    /// Root of the sysfs tree used for SR-IOV discovery.
    #[arg(long, env = "OVNK_SYSFS_ROOT", default_value = "/sys")]
    pub sysfs_root: PathBuf,

    /// Log filter when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[arg(long, env = "OVNK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Check values clap cannot.
    pub fn validate(&self) -> Result<()> {
        validate_mtu(self.mtu)?;
        if self.bridge.is_empty() {
            bail!("bridge name must not be empty");
        }
        if self.listen_tcp.is_none() && self.socket.as_os_str().is_empty() {
            bail!("either --socket or --listen-tcp is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["ovnk-cni-server"]).unwrap();
        assert_eq!(config.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.bridge, "br-int");
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
        assert!(config.listen_tcp.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "ovnk-cni-server",
            "--socket",
            "/tmp/cni.sock",
            "--listen-tcp",
            "127.0.0.1:3996",
            "--mtu",
            "9000",
            "--kube-api",
            "https://10.0.0.1:6443",
        ])
        .unwrap();
        assert_eq!(config.socket, PathBuf::from("/tmp/cni.sock"));
        assert_eq!(config.listen_tcp, Some("127.0.0.1:3996".parse().unwrap()));
        assert_eq!(config.mtu, 9000);
        assert_eq!(config.kube_api, "https://10.0.0.1:6443");
    }

    #[test]
    fn test_rejects_bad_mtu() {
        let config = Config::try_parse_from(["ovnk-cni-server", "--mtu", "100"]).unwrap();
        assert!(config.validate().is_err());
    }
}
