//! In-memory kernel for testing.
//!
//! [`MockKernel`] implements both [`LinkOps`] and [`NetnsExec`] over one
//! shared model, so a test can see which namespace each operation ran in
//! and what every link looks like afterwards.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ovnk_cni_types::{IpCidr, MacAddr};

use crate::link::{LinkError, LinkOps};
use crate::netns::{NetnsExec, NetnsWork};

/// Label of the initial namespace.
pub const HOST_NS: &str = "host";

/// State of one mock link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub id: u32,
    pub kind: Option<&'static str>,
    /// `id` of the other end of a veth pair.
    pub peer: Option<u32>,
    pub mac: MacAddr,
    pub mtu: u32,
    pub up: bool,
    pub txqueuelen: u32,
    pub addresses: Vec<IpCidr>,
    pub default_gateway: Option<IpAddr>,
}

#[derive(Debug)]
struct KernelState {
    current: String,
    links: BTreeMap<(String, String), MockLink>,
    namespaces: HashSet<PathBuf>,
    ops: Vec<String>,
    fail_on: Option<String>,
    next_mac: u8,
    next_id: u32,
}

/// Shared mock of links and namespaces.
#[derive(Debug)]
pub struct MockKernel {
    state: Mutex<KernelState>,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KernelState {
                current: HOST_NS.to_string(),
                links: BTreeMap::new(),
                namespaces: HashSet::new(),
                ops: Vec::new(),
                fail_on: None,
                next_mac: 1,
                next_id: 1,
            }),
        }
    }

    /// Register a namespace path that `check` and `run_in` accept.
    pub fn add_netns(&self, path: impl Into<PathBuf>) {
        self.lock().namespaces.insert(path.into());
    }

    /// Create a link in the host namespace.
    pub fn add_host_link(&self, name: &str, mac: MacAddr) {
        let mut state = self.lock();
        let id = state.take_id();
        state.links.insert(
            (HOST_NS.to_string(), name.to_string()),
            MockLink {
                id,
                kind: None,
                peer: None,
                mac,
                mtu: 1500,
                up: true,
                txqueuelen: 0,
                addresses: Vec::new(),
                default_gateway: None,
            },
        );
    }

    /// Fail the next operation whose log entry contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_on = Some(pattern.to_string());
    }

    /// Log of operations as `"<ns> <op> <args>"`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    /// Number of mutating operations performed (everything but reads).
    pub fn mutations(&self) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| {
                !op.contains(" mac_address ") && !op.contains(" link_kind ") && !op.contains(" enter ")
            })
            .count()
    }

    /// A link in namespace `ns` (use [`HOST_NS`] or the namespace path).
    pub fn link(&self, ns: &str, name: &str) -> Option<MockLink> {
        self.lock()
            .links
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of the links in a namespace.
    pub fn link_names(&self, ns: &str) -> Vec<String> {
        self.lock()
            .links
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KernelState> {
        // A panicking test thread must not hide the state from the next assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn op<T>(
        &self,
        entry: String,
        f: impl FnOnce(&mut KernelState) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut state = self.lock();
        let entry = format!("{} {}", state.current, entry);
        if state
            .fail_on
            .as_deref()
            .is_some_and(|pattern| entry.contains(pattern))
        {
            state.fail_on = None;
            return Err(LinkError::Command {
                cmd: entry,
                stderr: "injected failure".to_string(),
            });
        }
        state.ops.push(entry);
        f(&mut *state)
    }
}

impl KernelState {
    fn key(&self, name: &str) -> (String, String) {
        (self.current.clone(), name.to_string())
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut MockLink, LinkError> {
        let key = self.key(name);
        let current = self.current.clone();
        self.links.get_mut(&key).ok_or_else(|| LinkError::Command {
            cmd: format!("link {name}"),
            stderr: format!("Cannot find device \"{name}\" in {current}"),
        })
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fresh_link(&mut self, mtu: u32) -> MockLink {
        let n = self.next_mac;
        self.next_mac = self.next_mac.wrapping_add(1);
        MockLink {
            id: self.take_id(),
            kind: Some("veth"),
            peer: None,
            mac: MacAddr::new([0x02, 0, 0, 0, 0, n]),
            mtu,
            up: false,
            txqueuelen: 0,
            addresses: Vec::new(),
            default_gateway: None,
        }
    }
}

impl LinkOps for MockKernel {
    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<(), LinkError> {
        self.op(format!("add_veth {name} {peer} {mtu}"), |s| {
            for n in [name, peer] {
                let key = s.key(n);
                if s.links.contains_key(&key) {
                    return Err(LinkError::Command {
                        cmd: format!("add_veth {n}"),
                        stderr: "File exists".to_string(),
                    });
                }
            }
            let mut host = s.fresh_link(mtu);
            let mut other = s.fresh_link(mtu);
            host.peer = Some(other.id);
            other.peer = Some(host.id);
            let (host_key, other_key) = (s.key(name), s.key(peer));
            s.links.insert(host_key, host);
            s.links.insert(other_key, other);
            Ok(())
        })
    }

    fn set_name(&self, name: &str, new_name: &str) -> Result<(), LinkError> {
        self.op(format!("set_name {name} {new_name}"), |s| {
            let link = s.get_mut(name)?.clone();
            if link.up {
                return Err(LinkError::Command {
                    cmd: format!("set_name {name}"),
                    stderr: "Device or resource busy".to_string(),
                });
            }
            let key = s.key(name);
            s.links.remove(&key);
            let key = s.key(new_name);
            s.links.insert(key, link);
            Ok(())
        })
    }

    fn set_up(&self, name: &str) -> Result<(), LinkError> {
        self.op(format!("set_up {name}"), |s| {
            s.get_mut(name)?.up = true;
            Ok(())
        })
    }

    fn set_down(&self, name: &str) -> Result<(), LinkError> {
        self.op(format!("set_down {name}"), |s| {
            s.get_mut(name)?.up = false;
            Ok(())
        })
    }

    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<(), LinkError> {
        self.op(format!("set_mac {name} {mac}"), |s| {
            s.get_mut(name)?.mac = mac;
            Ok(())
        })
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), LinkError> {
        self.op(format!("set_mtu {name} {mtu}"), |s| {
            s.get_mut(name)?.mtu = mtu;
            Ok(())
        })
    }

    fn set_txqueuelen(&self, name: &str, qlen: u32) -> Result<(), LinkError> {
        self.op(format!("set_txqueuelen {name} {qlen}"), |s| {
            s.get_mut(name)?.txqueuelen = qlen;
            Ok(())
        })
    }

    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError> {
        self.op(format!("move_to_netns {name} {}", netns.display()), |s| {
            if !s.namespaces.contains(netns) {
                return Err(LinkError::Netns {
                    path: netns.display().to_string(),
                    reason: "no such namespace".to_string(),
                });
            }
            let key = s.key(name);
            let mut link = s.links.remove(&key).ok_or_else(|| LinkError::Command {
                cmd: format!("move_to_netns {name}"),
                stderr: format!("Cannot find device \"{name}\""),
            })?;
            // Moving a link brings it down.
            link.up = false;
            s.links
                .insert((netns.display().to_string(), name.to_string()), link);
            Ok(())
        })
    }

    fn add_address(&self, name: &str, address: &IpCidr) -> Result<(), LinkError> {
        self.op(format!("add_address {name} {address}"), |s| {
            s.get_mut(name)?.addresses.push(*address);
            Ok(())
        })
    }

    fn add_default_route(&self, name: &str, gateway: IpAddr) -> Result<(), LinkError> {
        self.op(format!("add_default_route {name} {gateway}"), |s| {
            let link = s.get_mut(name)?;
            if !link.up {
                return Err(LinkError::Command {
                    cmd: format!("add_default_route {name}"),
                    stderr: "Network is down".to_string(),
                });
            }
            link.default_gateway = Some(gateway);
            Ok(())
        })
    }

    fn mac_address(&self, name: &str) -> Result<MacAddr, LinkError> {
        self.op(format!("mac_address {name}"), |s| Ok(s.get_mut(name)?.mac))
    }

    fn link_kind(&self, name: &str) -> Result<Option<String>, LinkError> {
        self.op(format!("link_kind {name}"), |s| {
            let key = s.key(name);
            Ok(s.links.get(&key).and_then(|l| l.kind).map(str::to_string))
        })
    }

    fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        self.op(format!("delete_link {name}"), |s| {
            let key = s.key(name);
            let link = s.links.remove(&key).ok_or_else(|| LinkError::Command {
                cmd: format!("delete_link {name}"),
                stderr: format!("Cannot find device \"{name}\""),
            })?;
            if let Some(peer) = link.peer {
                s.links.retain(|_, l| l.id != peer);
            }
            Ok(())
        })
    }
}

impl NetnsExec for MockKernel {
    fn check(&self, path: &Path) -> Result<(), LinkError> {
        if self.lock().namespaces.contains(path) {
            Ok(())
        } else {
            Err(LinkError::Netns {
                path: path.display().to_string(),
                reason: "no such namespace".to_string(),
            })
        }
    }

    fn run_in<'a>(&self, path: &Path, work: NetnsWork<'a>) -> Result<(), LinkError> {
        self.check(path)?;
        let previous = {
            let mut state = self.lock();
            let previous =
                std::mem::replace(&mut state.current, path.display().to_string());
            state.ops.push(format!("{} enter {}", previous, path.display()));
            previous
        };
        let result = work();
        self.lock().current = previous;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netns::in_netns;

    #[test]
    fn test_namespace_switch_is_scoped() {
        let kernel = MockKernel::new();
        kernel.add_netns("/var/run/netns/pod");
        kernel.add_veth("host0", "peer0", 1400).unwrap();
        kernel
            .move_to_netns("peer0", Path::new("/var/run/netns/pod"))
            .unwrap();

        let mac = in_netns(&kernel, Path::new("/var/run/netns/pod"), || {
            kernel.set_name("peer0", "eth0")?;
            kernel.mac_address("eth0")
        })
        .unwrap();

        assert_eq!(kernel.link("/var/run/netns/pod", "eth0").unwrap().mac, mac);
        assert_eq!(kernel.link_names(HOST_NS), vec!["host0".to_string()]);
        // Back in the host namespace.
        assert!(kernel.set_up("eth0").is_err());
    }

    #[test]
    fn test_rename_requires_down() {
        let kernel = MockKernel::new();
        kernel.add_veth("a", "b", 1400).unwrap();
        kernel.set_up("a").unwrap();
        assert!(kernel.set_name("a", "c").is_err());
    }

    #[test]
    fn test_deleting_one_veth_end_removes_both() {
        let kernel = MockKernel::new();
        kernel.add_netns("/var/run/netns/pod");
        kernel.add_veth("host0", "peer0", 1400).unwrap();
        kernel
            .move_to_netns("peer0", Path::new("/var/run/netns/pod"))
            .unwrap();

        assert_eq!(kernel.link_kind("host0").unwrap().as_deref(), Some("veth"));
        kernel.delete_link("host0").unwrap();

        assert!(kernel.link_names(HOST_NS).is_empty());
        assert!(kernel.link_names("/var/run/netns/pod").is_empty());
        assert_eq!(kernel.link_kind("host0").unwrap(), None);
    }

    #[test]
    fn test_fail_on_injects_once() {
        let kernel = MockKernel::new();
        kernel.add_veth("a", "b", 1400).unwrap();
        kernel.fail_on("host set_up");
        assert!(kernel.set_up("a").is_err());
        assert!(kernel.set_up("a").is_ok());
    }
}
