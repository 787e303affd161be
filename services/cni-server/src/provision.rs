//! Pod interface provisioning.
//!
//! Drives one sandbox through
//!
//! ```text
//! Unprovisioned -> HostSideCreated -> MovedToNamespace -> Renamed
//!               -> AddressConfigured -> Attached
//! ```
//!
//! either with a veth pair (software path) or by handing an SR-IOV VF to the
//! pod and plugging its representor into the bridge (hardware path). Steps
//! are not rolled back on failure; teardown cleans up by sandbox ID.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ovnk_cni_types::{host_interface_name, placeholder_name, IpCidr, MacAddr, PodAnnotation};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::link::{LinkError, LinkOps};
use crate::netns::{in_netns, NetnsExec};
use crate::sriov::{resolve_representor, DeviceError, DeviceTree, RepresentorMapping};

/// Provisioning progress of one sandbox interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionState {
    Unprovisioned,
    HostSideCreated,
    MovedToNamespace,
    Renamed,
    AddressConfigured,
    Attached,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::HostSideCreated => "host_side_created",
            Self::MovedToNamespace => "moved_to_namespace",
            Self::Renamed => "renamed",
            Self::AddressConfigured => "address_configured",
            Self::Attached => "attached",
        };
        f.write_str(s)
    }
}

/// Errors from provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("device resolution failed: {0}")]
    Device(#[from] DeviceError),

    /// A kernel operation failed; `state` is the last state reached.
    #[error("interface setup failed after {state}: {source}")]
    Kernel {
        state: ProvisionState,
        #[source]
        source: LinkError,
    },
}

/// One end of a provisioned link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub mac: MacAddr,

    /// Owning namespace; `None` for the host namespace.
    pub netns: Option<PathBuf>,
}

/// What to provision for one sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub sandbox_id: &'a str,
    pub netns: &'a Path,
    pub ifname: &'a str,
    pub identity: &'a PodAnnotation,
    pub mtu: u32,

    /// PCI address of a VF; selects the hardware path.
    pub device: Option<&'a str>,
}

/// A provisioned link pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub host: InterfaceDescriptor,
    pub sandbox: InterfaceDescriptor,

    /// Set on the hardware path.
    pub representor: Option<RepresentorMapping>,
}

/// Tracks and logs state transitions for one request.
#[derive(Debug)]
pub struct Progress {
    sandbox_id: String,
    state: ProvisionState,
}

impl Progress {
    pub fn new(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            state: ProvisionState::Unprovisioned,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn advance(&mut self, next: ProvisionState) {
        debug!(
            sandbox = %self.sandbox_id,
            from = %self.state,
            to = %next,
            "Provisioning state transition"
        );
        self.state = next;
    }

    fn fail(&self, source: LinkError) -> ProvisionError {
        ProvisionError::Kernel {
            state: self.state,
            source,
        }
    }
}

/// Kernel-facing capabilities used for provisioning.
#[derive(Clone)]
pub struct Provisioner {
    links: Arc<dyn LinkOps>,
    netns: Arc<dyn NetnsExec>,
    devices: Arc<dyn DeviceTree>,
}

impl Provisioner {
    pub fn new(
        links: Arc<dyn LinkOps>,
        netns: Arc<dyn NetnsExec>,
        devices: Arc<dyn DeviceTree>,
    ) -> Self {
        Self {
            links,
            netns,
            devices,
        }
    }

    pub fn links(&self) -> &dyn LinkOps {
        self.links.as_ref()
    }

    /// Provision the sandbox interface, picking the path from `req.device`.
    ///
    /// Blocking; call from a blocking-capable thread.
    pub fn provision(
        &self,
        req: &ProvisionRequest<'_>,
        progress: &mut Progress,
    ) -> Result<Provisioned, ProvisionError> {
        self.netns
            .check(req.netns)
            .map_err(|e| progress.fail(e))?;

        let provisioned = match req.device {
            Some(pci) => self.provision_vf(req, pci, progress)?,
            None => self.provision_veth(req, progress)?,
        };

        info!(
            sandbox = %req.sandbox_id,
            host_iface = %provisioned.host.name,
            sandbox_iface = %provisioned.sandbox.name,
            state = %progress.state(),
            "Pod interface provisioned"
        );
        Ok(provisioned)
    }

    fn provision_veth(
        &self,
        req: &ProvisionRequest<'_>,
        progress: &mut Progress,
    ) -> Result<Provisioned, ProvisionError> {
        let links = self.links.as_ref();
        let host_name = host_interface_name(req.sandbox_id);
        let placeholder = placeholder_name(req.sandbox_id);

        links
            .add_veth(&host_name, &placeholder, req.mtu)
            .map_err(|e| progress.fail(e))?;
        progress.advance(ProvisionState::HostSideCreated);

        links
            .move_to_netns(&placeholder, req.netns)
            .map_err(|e| progress.fail(e))?;
        progress.advance(ProvisionState::MovedToNamespace);

        let result = in_netns(self.netns.as_ref(), req.netns, || {
            links.set_name(&placeholder, req.ifname)?;
            progress.advance(ProvisionState::Renamed);

            links.set_mac(req.ifname, req.identity.mac)?;
            links.set_mtu(req.ifname, req.mtu)?;
            configure_address(links, req.ifname, &req.identity.ip, req.identity.gateway)?;
            progress.advance(ProvisionState::AddressConfigured);
            Ok(())
        });
        result.map_err(|e| progress.fail(e))?;

        links.set_up(&host_name).map_err(|e| progress.fail(e))?;
        let host_mac = links.mac_address(&host_name).map_err(|e| progress.fail(e))?;

        Ok(Provisioned {
            host: InterfaceDescriptor {
                name: host_name,
                mac: host_mac,
                netns: None,
            },
            sandbox: self.sandbox_descriptor(req),
            representor: None,
        })
    }

    fn provision_vf(
        &self,
        req: &ProvisionRequest<'_>,
        pci: &str,
        progress: &mut Progress,
    ) -> Result<Provisioned, ProvisionError> {
        let links = self.links.as_ref();

        // Resolve before touching anything.
        let mapping = resolve_representor(self.devices.as_ref(), pci)?;
        let host_name = host_interface_name(req.sandbox_id);
        let placeholder = placeholder_name(req.sandbox_id);

        let rep_mac = links
            .mac_address(&mapping.representor)
            .map_err(|e| progress.fail(e))?;

        // The VF must leave the host namespace under a name that cannot clash
        // with the pod's interface name.
        let prepare = || -> Result<(), LinkError> {
            links.set_down(&mapping.vf)?;
            links.set_mac(&mapping.vf, req.identity.mac)?;
            links.set_name(&mapping.vf, &placeholder)
        };
        prepare().map_err(|e| progress.fail(e))?;
        progress.advance(ProvisionState::HostSideCreated);

        links
            .move_to_netns(&placeholder, req.netns)
            .map_err(|e| progress.fail(e))?;
        progress.advance(ProvisionState::MovedToNamespace);

        let result = in_netns(self.netns.as_ref(), req.netns, || {
            links.set_name(&placeholder, req.ifname)?;
            progress.advance(ProvisionState::Renamed);

            links.set_mtu(req.ifname, req.mtu)?;
            configure_address(links, req.ifname, &req.identity.ip, req.identity.gateway)?;
            progress.advance(ProvisionState::AddressConfigured);
            Ok(())
        });
        result.map_err(|e| progress.fail(e))?;

        let rename_representor = || -> Result<(), LinkError> {
            links.set_down(&mapping.representor)?;
            links.set_name(&mapping.representor, &host_name)?;
            links.set_up(&host_name)
        };
        rename_representor().map_err(|e| progress.fail(e))?;

        debug!(
            sandbox = %req.sandbox_id,
            representor = %mapping.representor,
            host_iface = %host_name,
            "Renamed VF representor"
        );

        Ok(Provisioned {
            host: InterfaceDescriptor {
                name: host_name,
                mac: rep_mac,
                netns: None,
            },
            sandbox: self.sandbox_descriptor(req),
            representor: Some(mapping),
        })
    }

    /// Remove veth ends a failed ADD left in the host namespace.
    ///
    /// Only links of kind `veth` are deleted, so a renamed VF representor is
    /// left alone. Failures are logged. Blocking.
    pub fn release(&self, sandbox_id: &str) {
        let links = self.links.as_ref();
        for name in [host_interface_name(sandbox_id), placeholder_name(sandbox_id)] {
            match links.link_kind(&name) {
                Ok(Some(kind)) if kind == "veth" => match links.delete_link(&name) {
                    Ok(()) => info!(sandbox = %sandbox_id, iface = %name, "Deleted host veth"),
                    Err(e) => {
                        warn!(sandbox = %sandbox_id, iface = %name, error = %e, "Failed to delete host veth")
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    warn!(sandbox = %sandbox_id, iface = %name, error = %e, "Failed to inspect host link")
                }
            }
        }
    }

    fn sandbox_descriptor(&self, req: &ProvisionRequest<'_>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            name: req.ifname.to_string(),
            mac: req.identity.mac,
            netns: Some(req.netns.to_path_buf()),
        }
    }
}

/// Bring a link up and give it an address and default route.
fn configure_address(
    links: &dyn LinkOps,
    name: &str,
    address: &IpCidr,
    gateway: std::net::IpAddr,
) -> Result<(), LinkError> {
    links.set_up(name)?;
    links.add_address(name, address)?;
    links.add_default_route(name, gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockKernel, HOST_NS};
    use crate::sriov::MockDeviceTree;

    const SANDBOX: &str = "9f86d081884c7d659a2feaa0c55ad015";
    const NETNS: &str = "/var/run/netns/cni-1234";
    const PCI: &str = "0000:81:00.2";
    const SWITCH: &str = "5c2f2b0003a1d4e2";

    fn identity() -> PodAnnotation {
        PodAnnotation::from_json(
            r#"{"ip_address":"10.1.2.3/24","mac_address":"0a:00:00:00:00:01","gateway_ip":"10.1.2.1"}"#,
        )
        .unwrap()
    }

    fn request<'a>(identity: &'a PodAnnotation, device: Option<&'a str>) -> ProvisionRequest<'a> {
        ProvisionRequest {
            sandbox_id: SANDBOX,
            netns: Path::new(NETNS),
            ifname: "eth0",
            identity,
            mtu: 1400,
            device,
        }
    }

    fn kernel() -> Arc<MockKernel> {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_netns(NETNS);
        kernel
    }

    fn provisioner(kernel: &Arc<MockKernel>, devices: MockDeviceTree) -> Provisioner {
        Provisioner::new(kernel.clone(), kernel.clone(), Arc::new(devices))
    }

    fn sriov_tree() -> MockDeviceTree {
        let mut tree = MockDeviceTree::new();
        tree.pf("ens2f0", SWITCH, &[Some("ens2f0v0"), Some("ens2f0v1")])
            .pci(PCI, "ens2f0v1")
            .representor("ens2f0_0", SWITCH, "pf0vf0")
            .representor("ens2f0_1", SWITCH, "pf0vf1");
        tree
    }

    fn sriov_kernel() -> Arc<MockKernel> {
        let kernel = kernel();
        kernel.add_host_link("ens2f0v1", MacAddr::new([0x52, 0x54, 0, 0, 0, 0x11]));
        kernel.add_host_link("ens2f0_1", MacAddr::new([0x52, 0x54, 0, 0, 0, 0x21]));
        kernel
    }

    #[test]
    fn test_veth_path() {
        let kernel = kernel();
        let identity = identity();
        let mut progress = Progress::new(SANDBOX);

        let out = provisioner(&kernel, MockDeviceTree::new())
            .provision(&request(&identity, None), &mut progress)
            .unwrap();

        assert_eq!(out.host.name, "9f86d081884c7d6");
        assert_eq!(out.host.name.len(), 15);
        assert_eq!(out.host.netns, None);
        assert_eq!(out.sandbox.name, "eth0");
        assert_eq!(out.sandbox.mac.to_string(), "0a:00:00:00:00:01");
        assert_eq!(out.sandbox.netns.as_deref(), Some(Path::new(NETNS)));
        assert!(out.representor.is_none());
        assert_eq!(progress.state(), ProvisionState::AddressConfigured);

        let pod_link = kernel.link(NETNS, "eth0").unwrap();
        assert_eq!(pod_link.mac, identity.mac);
        assert_eq!(pod_link.mtu, 1400);
        assert!(pod_link.up);
        assert_eq!(pod_link.addresses, vec![identity.ip]);
        assert_eq!(pod_link.default_gateway, Some(identity.gateway));

        let host_link = kernel.link(HOST_NS, &out.host.name).unwrap();
        assert!(host_link.up);
        assert_eq!(host_link.mac, out.host.mac);
        assert_eq!(kernel.link_names(HOST_NS), vec![out.host.name.clone()]);
    }

    #[test]
    fn test_veth_moves_before_rename() {
        let kernel = kernel();
        let identity = identity();
        provisioner(&kernel, MockDeviceTree::new())
            .provision(&request(&identity, None), &mut Progress::new(SANDBOX))
            .unwrap();

        let ops = kernel.ops();
        let moved = ops.iter().position(|o| o.contains("move_to_netns")).unwrap();
        let renamed = ops.iter().position(|o| o.contains("set_name")).unwrap();
        assert!(moved < renamed);
        assert!(ops[renamed].starts_with(NETNS));
        assert!(ops[moved].starts_with(HOST_NS));
    }

    #[test]
    fn test_vf_path() {
        let kernel = sriov_kernel();
        let identity = identity();
        let mut progress = Progress::new(SANDBOX);

        let out = provisioner(&kernel, sriov_tree())
            .provision(&request(&identity, Some(PCI)), &mut progress)
            .unwrap();

        let mapping = out.representor.as_ref().unwrap();
        assert_eq!(mapping.representor, "ens2f0_1");
        assert_eq!(mapping.vf_index, 1);
        assert_eq!(mapping.switch_id, SWITCH);

        // Representor renamed to the sandbox-derived name and kept its MAC.
        assert_eq!(out.host.name, host_interface_name(SANDBOX));
        assert_eq!(out.host.mac, MacAddr::new([0x52, 0x54, 0, 0, 0, 0x21]));
        let rep = kernel.link(HOST_NS, &out.host.name).unwrap();
        assert!(rep.up);
        assert!(kernel.link(HOST_NS, "ens2f0_1").is_none());
        assert!(kernel.link(HOST_NS, "ens2f0v1").is_none());

        let vf = kernel.link(NETNS, "eth0").unwrap();
        assert_eq!(vf.mac, identity.mac);
        assert_eq!(vf.mtu, 1400);
        assert_eq!(vf.addresses, vec![identity.ip]);
        assert_eq!(vf.default_gateway, Some(identity.gateway));
    }

    #[test]
    fn test_release_keeps_representor() {
        let kernel = sriov_kernel();
        let identity = identity();
        let provisioner = provisioner(&kernel, sriov_tree());
        provisioner
            .provision(&request(&identity, Some(PCI)), &mut Progress::new(SANDBOX))
            .unwrap();

        provisioner.release(SANDBOX);

        assert!(kernel.link(HOST_NS, &host_interface_name(SANDBOX)).is_some());
        assert!(!kernel.ops().iter().any(|o| o.contains("delete_link")));
    }

    #[test]
    fn test_vf_mac_set_in_host_namespace_before_move() {
        let kernel = sriov_kernel();
        let identity = identity();
        provisioner(&kernel, sriov_tree())
            .provision(&request(&identity, Some(PCI)), &mut Progress::new(SANDBOX))
            .unwrap();

        let ops = kernel.ops();
        let set_mac = ops
            .iter()
            .position(|o| o == "host set_mac ens2f0v1 0a:00:00:00:00:01")
            .unwrap();
        let moved = ops
            .iter()
            .position(|o| o == &format!("host move_to_netns tmp9f86d081884c {NETNS}"))
            .unwrap();
        let renamed = ops
            .iter()
            .position(|o| o == &format!("{NETNS} set_name tmp9f86d081884c eth0"))
            .unwrap();
        assert!(set_mac < moved && moved < renamed);
    }

    #[test]
    fn test_ambiguous_representor_performs_no_mutation() {
        let kernel = sriov_kernel();
        let mut tree = sriov_tree();
        tree.representor("ens2f0_1b", SWITCH, "1");
        let identity = identity();

        let err = provisioner(&kernel, tree)
            .provision(&request(&identity, Some(PCI)), &mut Progress::new(SANDBOX))
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Device(DeviceError::AmbiguousRepresentor { .. })
        ));
        assert_eq!(kernel.mutations(), 0);
    }

    #[test]
    fn test_missing_representor_performs_no_mutation() {
        let kernel = sriov_kernel();
        let mut tree = MockDeviceTree::new();
        tree.pf("ens2f0", SWITCH, &[Some("ens2f0v0"), Some("ens2f0v1")])
            .pci(PCI, "ens2f0v1");
        let identity = identity();

        let err = provisioner(&kernel, tree)
            .provision(&request(&identity, Some(PCI)), &mut Progress::new(SANDBOX))
            .unwrap_err();

        assert!(err.to_string().contains("ens2f0v1"));
        assert_eq!(kernel.mutations(), 0);
    }

    #[test]
    fn test_unknown_netns_fails_before_mutation() {
        let kernel = Arc::new(MockKernel::new());
        let identity = identity();

        let err = provisioner(&kernel, MockDeviceTree::new())
            .provision(&request(&identity, None), &mut Progress::new(SANDBOX))
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Kernel {
                state: ProvisionState::Unprovisioned,
                source: LinkError::Netns { .. }
            }
        ));
        assert!(kernel.ops().is_empty());
    }

    #[test]
    fn test_route_failure_aborts_without_rollback() {
        let kernel = kernel();
        kernel.fail_on("add_default_route");
        let identity = identity();
        let mut progress = Progress::new(SANDBOX);

        let err = provisioner(&kernel, MockDeviceTree::new())
            .provision(&request(&identity, None), &mut progress)
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Kernel {
                state: ProvisionState::Renamed,
                ..
            }
        ));
        // Partial state stays for teardown to find.
        assert!(kernel.link(NETNS, "eth0").is_some());
        assert!(kernel.link(HOST_NS, &host_interface_name(SANDBOX)).is_some());
        assert!(!kernel.ops().iter().any(|o| o.contains("set_up 9f86d081884c7d6")));
    }

    #[test]
    fn test_concurrent_sandboxes_use_distinct_placeholders() {
        let kernel = kernel();
        kernel.add_netns("/var/run/netns/other");
        let identity = identity();
        let p = provisioner(&kernel, MockDeviceTree::new());

        p.provision(&request(&identity, None), &mut Progress::new(SANDBOX))
            .unwrap();
        let mut second = request(&identity, None);
        second.sandbox_id = "0123456789abcdef0123";
        second.netns = Path::new("/var/run/netns/other");
        p.provision(&second, &mut Progress::new(second.sandbox_id))
            .unwrap();

        assert_eq!(kernel.link_names(HOST_NS).len(), 2);
        assert!(kernel.link("/var/run/netns/other", "eth0").is_some());
    }
}
