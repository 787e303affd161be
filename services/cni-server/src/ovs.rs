//! Integration bridge attachment and bandwidth shaping via `ovs-vsctl`.
//!
//! The switch is driven only through its administrative CLI; exit status and
//! combined output are the only feedback.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::{Arc, Mutex};

use ovnk_cni_types::{host_interface_name, IpCidr, MacAddr};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::annotations::Bandwidth;

/// Errors from switch commands.
#[derive(Debug, Error)]
pub enum OvsError {
    #[error("ovs-vsctl {args} failed: {output}")]
    Command { args: String, output: String },

    #[error("failed to run ovs-vsctl: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected ovs-vsctl output for {args}: {output:?}")]
    Malformed { args: String, output: String },
}

impl OvsError {
    fn output(&self) -> &str {
        match self {
            Self::Command { output, .. } | Self::Malformed { output, .. } => output,
            Self::Io(_) => "",
        }
    }
}

/// Runs switch administration commands.
pub trait Vsctl: Send + Sync {
    /// Run one command line; returns trimmed stdout.
    fn run(&self, args: &[&str]) -> Result<String, OvsError>;
}

/// Real `ovs-vsctl` invocation.
#[derive(Debug, Clone)]
pub struct OvsVsctl {
    timeout_secs: u32,
}

impl Default for OvsVsctl {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl OvsVsctl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vsctl for OvsVsctl {
    fn run(&self, args: &[&str]) -> Result<String, OvsError> {
        let timeout = format!("--timeout={}", self.timeout_secs);
        debug!(args = ?args, "Running ovs-vsctl");

        let output = Command::new("ovs-vsctl").arg(&timeout).args(args).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OvsError::Command {
                args: args.join(" "),
                output: format!("{}{}", stdout, stderr).trim().to_string(),
            });
        }
        Ok(stdout.trim().to_string())
    }
}

/// Metadata tagged onto a pod's bridge port.
#[derive(Debug, Clone)]
pub struct PortAttachment<'a> {
    pub sandbox_id: &'a str,
    pub pod_namespace: &'a str,
    pub pod_name: &'a str,
    pub mac: MacAddr,
    pub ip: IpCidr,
}

impl PortAttachment<'_> {
    /// Logical switch port name the controller expects.
    pub fn iface_id(&self) -> String {
        format!("{}_{}", self.pod_namespace, self.pod_name)
    }
}

/// Pod ports on one bridge.
#[derive(Clone)]
pub struct Ovs {
    vsctl: Arc<dyn Vsctl>,
    bridge: String,
}

impl Ovs {
    pub fn new(vsctl: Arc<dyn Vsctl>, bridge: impl Into<String>) -> Self {
        Self {
            vsctl,
            bridge: bridge.into(),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Add `iface` to the bridge tagged with the pod's identity.
    pub fn attach_port(&self, iface: &str, pod: &PortAttachment<'_>) -> Result<(), OvsError> {
        let attached_mac = format!("external_ids:attached_mac={}", pod.mac);
        let iface_id = format!("external_ids:iface-id={}", pod.iface_id());
        let ip_address = format!("external_ids:ip_address={}", pod.ip);
        let sandbox = format!("external_ids:sandbox={}", pod.sandbox_id);

        self.vsctl.run(&[
            "add-port",
            &self.bridge,
            iface,
            "--",
            "set",
            "interface",
            iface,
            &attached_mac,
            &iface_id,
            &ip_address,
            &sandbox,
        ])?;

        info!(
            bridge = %self.bridge,
            iface,
            iface_id = %pod.iface_id(),
            sandbox = %pod.sandbox_id,
            "Attached pod port"
        );
        Ok(())
    }

    /// Remove every QoS row tagged with `sandbox_id`.
    ///
    /// Failures are logged, never returned.
    pub fn clear_bandwidth(&self, sandbox_id: &str) {
        let tag = format!("external-ids:sandbox={sandbox_id}");

        match self.find("port", &tag) {
            Ok(ports) => {
                for port in ports {
                    if let Err(e) = self.vsctl.run(&["clear", "port", &port, "qos"]) {
                        warn!(sandbox = %sandbox_id, port = %port, error = %e, "Failed to clear port QoS");
                    }
                }
            }
            Err(e) => warn!(sandbox = %sandbox_id, error = %e, "Failed to look up shaped ports"),
        }

        match self.find("qos", &tag) {
            Ok(rows) => {
                for qos in rows {
                    if let Err(e) = self.vsctl.run(&["destroy", "qos", &qos]) {
                        warn!(sandbox = %sandbox_id, qos = %qos, error = %e, "Failed to destroy QoS");
                    }
                }
            }
            Err(e) => warn!(sandbox = %sandbox_id, error = %e, "Failed to look up QoS rows"),
        }
    }

    /// Apply rate limits to a pod port.
    ///
    /// Pod ingress is switch egress and is shaped with an HTB QoS; pod egress
    /// is switch ingress and is policed on the interface.
    pub fn set_bandwidth(
        &self,
        sandbox_id: &str,
        iface: &str,
        bandwidth: &Bandwidth,
    ) -> Result<(), OvsError> {
        let tag = format!("external-ids:sandbox={sandbox_id}");

        if bandwidth.ingress_bps > 0 {
            let max_rate = format!("other-config:max-rate={}", bandwidth.ingress_bps);
            let args = ["create", "qos", "type=linux-htb", max_rate.as_str(), tag.as_str()];
            let uuid = self.vsctl.run(&args)?;
            if uuid.is_empty() || uuid.contains(char::is_whitespace) {
                return Err(OvsError::Malformed {
                    args: args.join(" "),
                    output: uuid,
                });
            }
            let qos = format!("qos={uuid}");
            self.vsctl.run(&["set", "port", iface, &qos, &tag])?;
        }

        if bandwidth.egress_bps > 0 {
            // ingress_policing_rate is in kbps.
            let rate = format!("ingress_policing_rate={}", bandwidth.egress_bps / 1000);
            self.vsctl.run(&["set", "interface", iface, &rate])?;
        }

        info!(
            sandbox = %sandbox_id,
            iface,
            ingress_bps = bandwidth.ingress_bps,
            egress_bps = bandwidth.egress_bps,
            "Applied pod bandwidth limits"
        );
        Ok(())
    }

    /// Remove a sandbox's port and shaping. Never fails.
    pub fn teardown(&self, sandbox_id: &str) {
        let iface = host_interface_name(sandbox_id);

        match self.vsctl.run(&["del-port", &self.bridge, &iface]) {
            Ok(_) => info!(bridge = %self.bridge, iface = %iface, "Deleted pod port"),
            Err(e) if e.output().contains("no port named") => {
                debug!(bridge = %self.bridge, iface = %iface, "Pod port already gone");
            }
            Err(e) => warn!(bridge = %self.bridge, iface = %iface, error = %e, "Failed to delete pod port"),
        }

        self.clear_bandwidth(sandbox_id);
    }

    fn find(&self, table: &str, condition: &str) -> Result<Vec<String>, OvsError> {
        let out = self.vsctl.run(&[
            "--no-headings",
            "--data=bare",
            "--columns=_uuid",
            "find",
            table,
            condition,
        ])?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Default)]
struct SwitchState {
    /// Port name -> tags (`key=value`).
    ports: BTreeMap<String, BTreeSet<String>>,
    port_qos: BTreeMap<String, String>,
    interface_settings: BTreeMap<String, BTreeSet<String>>,
    qos: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<String>,
    fail_on: Option<String>,
    next_uuid: u32,
}

/// In-memory switch that understands the commands [`Ovs`] issues.
#[derive(Debug, Default)]
pub struct MockVsctl {
    state: Mutex<SwitchState>,
}

impl MockVsctl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command line run so far.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Ports currently on the bridge.
    pub fn ports(&self) -> Vec<String> {
        self.lock().ports.keys().cloned().collect()
    }

    /// Values set on a port or interface, e.g. `external_ids:sandbox=..`.
    pub fn port_settings(&self, name: &str) -> Vec<String> {
        let state = self.lock();
        let mut out: Vec<String> = state
            .ports
            .get(name)
            .into_iter()
            .chain(state.interface_settings.get(name))
            .flatten()
            .cloned()
            .collect();
        if let Some(qos) = state.port_qos.get(name) {
            out.push(format!("qos={qos}"));
        }
        out
    }

    /// Number of QoS rows.
    pub fn qos_count(&self) -> usize {
        self.lock().qos.len()
    }

    /// Fail the next command containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_on = Some(pattern.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn failed(args: &[&str], output: &str) -> OvsError {
    OvsError::Command {
        args: args.join(" "),
        output: output.to_string(),
    }
}

impl Vsctl for MockVsctl {
    fn run(&self, args: &[&str]) -> Result<String, OvsError> {
        let mut state = self.lock();
        let line = args.join(" ");
        state.calls.push(line.clone());

        if state.fail_on.as_deref().is_some_and(|p| line.contains(p)) {
            state.fail_on = None;
            return Err(failed(args, "injected failure"));
        }

        // Skip output formatting flags.
        let args: Vec<&str> = args
            .iter()
            .copied()
            .skip_while(|a| a.starts_with("--"))
            .collect();

        match args.as_slice() {
            ["add-port", _bridge, iface, "--", "set", "interface", _, settings @ ..] => {
                if state.ports.contains_key(*iface) {
                    return Err(failed(&args, &format!("cannot create a port named {iface} because a port named {iface} already exists")));
                }
                state.ports.insert(iface.to_string(), BTreeSet::new());
                state.interface_settings.insert(
                    iface.to_string(),
                    settings.iter().map(|s| s.to_string()).collect(),
                );
                Ok(String::new())
            }
            ["del-port", bridge, iface] => {
                if state.ports.remove(*iface).is_none() {
                    return Err(failed(&args, &format!("ovs-vsctl: no port named {iface} on bridge {bridge}")));
                }
                state.interface_settings.remove(*iface);
                state.port_qos.remove(*iface);
                Ok(String::new())
            }
            ["find", "port", tag] => Ok(state
                .ports
                .iter()
                .filter(|(_, tags)| tags.contains(*tag))
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
                .join("\n")),
            ["find", "qos", tag] => Ok(state
                .qos
                .iter()
                .filter(|(_, tags)| tags.contains(*tag))
                .map(|(uuid, _)| uuid.clone())
                .collect::<Vec<_>>()
                .join("\n")),
            ["clear", "port", port, "qos"] => {
                state.port_qos.remove(*port);
                Ok(String::new())
            }
            ["destroy", "qos", uuid] => {
                if state.port_qos.values().any(|q| q == uuid) {
                    return Err(failed(&args, "cannot delete QoS row because of references"));
                }
                state.qos.remove(*uuid);
                Ok(String::new())
            }
            ["create", "qos", settings @ ..] => {
                state.next_uuid += 1;
                let uuid = format!("00000000-0000-0000-0000-{:012}", state.next_uuid);
                state
                    .qos
                    .insert(uuid.clone(), settings.iter().map(|s| s.to_string()).collect());
                Ok(uuid)
            }
            ["set", "port", port, settings @ ..] => {
                let Some(tags) = state.ports.get_mut(*port) else {
                    return Err(failed(&args, &format!("no row \"{port}\" in table Port")));
                };
                let mut qos = None;
                for setting in settings {
                    match setting.strip_prefix("qos=") {
                        Some(uuid) => qos = Some(uuid.to_string()),
                        None => {
                            tags.insert(setting.to_string());
                        }
                    }
                }
                if let Some(qos) = qos {
                    state.port_qos.insert(port.to_string(), qos);
                }
                Ok(String::new())
            }
            ["set", "interface", iface, settings @ ..] => {
                let Some(values) = state.interface_settings.get_mut(*iface) else {
                    return Err(failed(&args, &format!("no row \"{iface}\" in table Interface")));
                };
                values.extend(settings.iter().map(|s| s.to_string()));
                Ok(String::new())
            }
            _ => Err(failed(&args, "unsupported command")),
        }
    }
}
