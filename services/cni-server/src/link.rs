//! Kernel link operations.
//!
//! Every operation acts in the network namespace of the calling thread; use
//! [`crate::netns::NetnsExec`] to run them inside a pod namespace.

use std::io;
use std::path::Path;
use std::process::Command;

use ovnk_cni_types::{IpCidr, MacAddr};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from link and namespace operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("command execution failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse link state: {0}")]
    Parse(String),

    #[error("network namespace {path}: {reason}")]
    Netns { path: String, reason: String },
}

/// Link manipulation in the current network namespace.
pub trait LinkOps: Send + Sync {
    /// Create a veth pair with both ends sharing `mtu`.
    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<(), LinkError>;

    /// Rename a link. The link must be down.
    fn set_name(&self, name: &str, new_name: &str) -> Result<(), LinkError>;

    fn set_up(&self, name: &str) -> Result<(), LinkError>;

    fn set_down(&self, name: &str) -> Result<(), LinkError>;

    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<(), LinkError>;

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), LinkError>;

    fn set_txqueuelen(&self, name: &str, qlen: u32) -> Result<(), LinkError>;

    /// Move a link into the namespace referenced by `netns`.
    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError>;

    fn add_address(&self, name: &str, address: &IpCidr) -> Result<(), LinkError>;

    /// Install a default route via `gateway` out of `name`.
    fn add_default_route(&self, name: &str, gateway: std::net::IpAddr) -> Result<(), LinkError>;

    /// Current hardware address of a link.
    fn mac_address(&self, name: &str) -> Result<MacAddr, LinkError>;

    /// Driver kind of a link (`veth`, ...). `None` when the link does not
    /// exist or is a plain device without one.
    fn link_kind(&self, name: &str) -> Result<Option<String>, LinkError>;

    /// Delete a link. Deleting one end of a veth pair removes both.
    fn delete_link(&self, name: &str) -> Result<(), LinkError>;
}

/// [`LinkOps`] backed by the iproute2 `ip` command.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2;

impl IpRoute2 {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Deserialize)]
struct LinkShow {
    address: Option<String>,
    linkinfo: Option<LinkInfo>,
}

#[derive(Deserialize)]
struct LinkInfo {
    info_kind: Option<String>,
}

impl LinkOps for IpRoute2 {
    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<(), LinkError> {
        let mtu = mtu.to_string();
        run_ip(&[
            "link", "add", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu", &mtu,
        ])
        .map(drop)
    }

    fn set_name(&self, name: &str, new_name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "name", new_name]).map(drop)
    }

    fn set_up(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "up"]).map(drop)
    }

    fn set_down(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "down"]).map(drop)
    }

    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "address", &mac.to_string()]).map(drop)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()]).map(drop)
    }

    fn set_txqueuelen(&self, name: &str, qlen: u32) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "txqueuelen", &qlen.to_string()]).map(drop)
    }

    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError> {
        // iproute2 opens a path argument and moves the link by fd.
        let netns = netns.to_string_lossy();
        run_ip(&["link", "set", "dev", name, "netns", &netns]).map(drop)
    }

    fn add_address(&self, name: &str, address: &IpCidr) -> Result<(), LinkError> {
        let family = if address.address.is_ipv6() { "-6" } else { "-4" };
        run_ip(&[family, "addr", "add", &address.to_string(), "dev", name]).map(drop)
    }

    fn add_default_route(&self, name: &str, gateway: std::net::IpAddr) -> Result<(), LinkError> {
        let family = if gateway.is_ipv6() { "-6" } else { "-4" };
        run_ip(&[
            family,
            "route",
            "add",
            "default",
            "via",
            &gateway.to_string(),
            "dev",
            name,
        ])
        .map(drop)
    }

    fn mac_address(&self, name: &str) -> Result<MacAddr, LinkError> {
        let output = run_ip(&["-j", "link", "show", "dev", name])?;
        parse_link_mac(&output)
    }

    fn link_kind(&self, name: &str) -> Result<Option<String>, LinkError> {
        match run_ip(&["-j", "-d", "link", "show", "dev", name]) {
            Ok(output) => parse_link_kind(&output),
            Err(LinkError::Command { stderr, .. }) if stderr.contains("does not exist") => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "del", "dev", name]).map(drop)
    }
}

fn parse_link_kind(json: &str) -> Result<Option<String>, LinkError> {
    let links: Vec<LinkShow> =
        serde_json::from_str(json).map_err(|e| LinkError::Parse(e.to_string()))?;
    Ok(links
        .into_iter()
        .next()
        .and_then(|l| l.linkinfo)
        .and_then(|info| info.info_kind))
}

fn parse_link_mac(json: &str) -> Result<MacAddr, LinkError> {
    let links: Vec<LinkShow> =
        serde_json::from_str(json).map_err(|e| LinkError::Parse(e.to_string()))?;
    let address = links
        .into_iter()
        .next()
        .and_then(|l| l.address)
        .ok_or_else(|| LinkError::Parse("link has no hardware address".to_string()))?;
    address
        .parse()
        .map_err(|e: ovnk_cni_types::TypesError| LinkError::Parse(e.to_string()))
}

/// Run an `ip` command and return its stdout.
fn run_ip(args: &[&str]) -> Result<String, LinkError> {
    debug!(args = ?args, "Running ip command");

    let output = Command::new("ip").args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LinkError::Command {
            cmd: format!("ip {}", args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_mac() {
        let json = r#"[{"ifindex":7,"ifname":"veth0","mtu":1400,"address":"AA:BB:cc:dd:ee:0f","broadcast":"ff:ff:ff:ff:ff:ff"}]"#;
        assert_eq!(
            parse_link_mac(json).unwrap(),
            MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f])
        );
    }

    #[test]
    fn test_parse_link_mac_missing() {
        assert!(matches!(parse_link_mac("[]"), Err(LinkError::Parse(_))));
        assert!(matches!(
            parse_link_mac(r#"[{"ifname":"lo"}]"#),
            Err(LinkError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_link_kind() {
        let veth = r#"[{"ifindex":9,"ifname":"9f86d081884c7d6","linkinfo":{"info_kind":"veth"}}]"#;
        assert_eq!(parse_link_kind(veth).unwrap().as_deref(), Some("veth"));

        let nic = r#"[{"ifindex":2,"ifname":"ens2f0_1","address":"52:54:00:00:00:21"}]"#;
        assert_eq!(parse_link_kind(nic).unwrap(), None);
    }

    #[test]
    fn test_command_error_names_the_command() {
        let err = LinkError::Command {
            cmd: "ip link set dev nope up".to_string(),
            stderr: "Cannot find device \"nope\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ip link set dev nope up failed: Cannot find device \"nope\""
        );
    }
}
