//! SR-IOV virtual function and representor discovery.
//!
//! A pod asking for a hardware-offloaded interface names a VF by PCI address.
//! To plug it into the integration bridge we need the VF's *representor*,
//! the switch-side netdev that mirrors its traffic. Representor names are
//! driver specific, so the only stable link is attribute correlation:
//!
//! ```text
//! bus/pci/devices/<pci>/net/<vf>              VF netdev
//! class/net/<vf>/device/physfn/net/<pf>       owning PF
//! class/net/<pf>/device/virtfn<i>/net/<vf>    VF index i
//! class/net/<pf>/phys_switch_id               switch (eswitch) identity
//! class/net/<rep>/phys_switch_id + phys_port_name == (pf switch id, i)
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Errors from device discovery.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no network device bound to PCI address {0}")]
    NoNetdev(String),

    #[error("PCI address {pci} has {} network devices ({}), expected one", .netdevs.len(), .netdevs.join(", "))]
    MultipleNetdevs { pci: String, netdevs: Vec<String> },

    #[error("VF {0} has no physical function")]
    NoPhysfn(String),

    #[error("VF {vf} not found among {numvfs} virtual functions of {pf}")]
    VfIndexNotFound { vf: String, pf: String, numvfs: u32 },

    #[error("no representor found for VF {vf} (switch {switch_id}, port {index})")]
    RepresentorNotFound {
        vf: String,
        switch_id: String,
        index: u32,
    },

    #[error("multiple representors match VF {vf} (switch {switch_id}, port {index}): {}", .candidates.join(", "))]
    AmbiguousRepresentor {
        vf: String,
        switch_id: String,
        index: u32,
        candidates: Vec<String>,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {value:?}")]
    Parse { path: String, value: String },
}

/// Read-only view of the device tree (sysfs).
///
/// Paths are relative to the tree root, e.g. `class/net/eth0/phys_switch_id`.
pub trait DeviceTree: Send + Sync {
    /// Names of the entries in a directory.
    fn list(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Contents of an attribute file, trimmed.
    fn read(&self, path: &Path) -> io::Result<String>;
}

/// The real sysfs tree.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    /// Tree rooted at `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl DeviceTree for Sysfs {
    fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = std::fs::read_dir(self.root.join(path))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        // read_dir order is unspecified; keep lookups deterministic.
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        Ok(std::fs::read_to_string(self.root.join(path))?.trim().to_string())
    }
}

/// Result of correlating a VF with its representor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepresentorMapping {
    /// VF network device in the host namespace.
    pub vf: String,

    /// Owning physical function.
    pub pf: String,

    /// Index of the VF under its PF.
    pub vf_index: u32,

    /// Switch identity shared by the PF and the representor.
    pub switch_id: String,

    /// Representor netdev.
    pub representor: String,
}

fn net_path(dev: &str) -> PathBuf {
    Path::new("class/net").join(dev)
}

fn read_attr(tree: &dyn DeviceTree, path: &Path) -> Result<String, DeviceError> {
    tree.read(path).map_err(|source| DeviceError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn list_dir(tree: &dyn DeviceTree, path: &Path) -> Result<Vec<String>, DeviceError> {
    tree.list(path).map_err(|source| DeviceError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// The single network device bound to a PCI function.
pub fn vf_netdev(tree: &dyn DeviceTree, pci: &str) -> Result<String, DeviceError> {
    let path = Path::new("bus/pci/devices").join(pci).join("net");
    let mut netdevs = match tree.list(&path) {
        Ok(netdevs) => netdevs,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DeviceError::NoNetdev(pci.to_string()))
        }
        Err(source) => {
            return Err(DeviceError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };

    match netdevs.len() {
        0 => Err(DeviceError::NoNetdev(pci.to_string())),
        1 => Ok(netdevs.remove(0)),
        _ => Err(DeviceError::MultipleNetdevs {
            pci: pci.to_string(),
            netdevs,
        }),
    }
}

/// Physical function owning a VF, via the `physfn` backlink.
pub fn pf_name(tree: &dyn DeviceTree, vf: &str) -> Result<String, DeviceError> {
    let path = net_path(vf).join("device/physfn/net");
    list_dir(tree, &path)?
        .into_iter()
        .next()
        .ok_or_else(|| DeviceError::NoPhysfn(vf.to_string()))
}

/// Number of VFs currently enabled on a PF.
pub fn numvfs(tree: &dyn DeviceTree, pf: &str) -> Result<u32, DeviceError> {
    let path = net_path(pf).join("device/sriov_numvfs");
    let value = read_attr(tree, &path)?;
    value.parse().map_err(|_| DeviceError::Parse {
        path: path.display().to_string(),
        value,
    })
}

/// Index of `vf` among the PF's virtual functions.
pub fn vf_index(tree: &dyn DeviceTree, pf: &str, vf: &str) -> Result<u32, DeviceError> {
    let numvfs = numvfs(tree, pf)?;
    for index in 0..numvfs {
        let path = net_path(pf).join(format!("device/virtfn{index}/net"));
        // A VF already handed to a pod has an empty `net` directory here; one
        // bound to a userspace driver such as vfio-pci has none at all.
        let netdevs = match tree.list(&path) {
            Ok(netdevs) => netdevs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(DeviceError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        if netdevs.first().map(String::as_str) == Some(vf) {
            return Ok(index);
        }
    }
    Err(DeviceError::VfIndexNotFound {
        vf: vf.to_string(),
        pf: pf.to_string(),
        numvfs,
    })
}

/// Hardware switch identity of a netdev.
pub fn switch_id(tree: &dyn DeviceTree, dev: &str) -> Result<String, DeviceError> {
    read_attr(tree, &net_path(dev).join("phys_switch_id"))
}

/// VF index a representor stands for, from its `phys_port_name`.
///
/// Older drivers report a bare number, newer ones `pf<N>vf<M>`. Uplink
/// (`p0`) and PF (`pf0`) representors yield an error.
pub fn port_index(tree: &dyn DeviceTree, dev: &str) -> Result<u32, DeviceError> {
    let path = net_path(dev).join("phys_port_name");
    let value = read_attr(tree, &path)?;
    parse_port_name(&value).ok_or_else(|| DeviceError::Parse {
        path: path.display().to_string(),
        value,
    })
}

fn parse_port_name(name: &str) -> Option<u32> {
    if let Ok(index) = name.parse() {
        return Some(index);
    }
    let rest = name.strip_prefix("pf")?;
    let (_pf, vf) = rest.split_once("vf")?;
    vf.parse().ok()
}

/// Find the representor for the VF at `pci`.
///
/// Exactly one netdev must carry the PF's switch identity and the VF's index
/// as port; none or several is an error. Devices without those attributes
/// are not representors and are skipped.
pub fn resolve_representor(
    tree: &dyn DeviceTree,
    pci: &str,
) -> Result<RepresentorMapping, DeviceError> {
    let vf = vf_netdev(tree, pci)?;
    let pf = pf_name(tree, &vf)?;
    let index = vf_index(tree, &pf, &vf)?;
    let switch = switch_id(tree, &pf)?;
    debug!(pci, vf = %vf, pf = %pf, vf_index = index, switch_id = %switch, "Resolved VF");

    let candidates: Vec<String> = list_dir(tree, Path::new("class/net"))?
        .into_iter()
        .filter(|dev| {
            matches!(
                (switch_id(tree, dev), port_index(tree, dev)),
                (Ok(id), Ok(port)) if id == switch && port == index
            )
        })
        .collect();

    let representor = match <[String; 1]>::try_from(candidates) {
        Ok([representor]) => representor,
        Err(candidates) if candidates.is_empty() => {
            return Err(DeviceError::RepresentorNotFound {
                vf,
                switch_id: switch,
                index,
            })
        }
        Err(candidates) => {
            return Err(DeviceError::AmbiguousRepresentor {
                vf,
                switch_id: switch,
                index,
                candidates,
            })
        }
    };

    info!(pci, vf = %vf, representor = %representor, "Resolved VF representor");

    Ok(RepresentorMapping {
        vf,
        pf,
        vf_index: index,
        switch_id: switch,
        representor,
    })
}

// =============================================================================
// Mock
// =============================================================================

/// In-memory device tree for testing.
#[derive(Debug, Default, Clone)]
pub struct MockDeviceTree {
    dirs: HashMap<PathBuf, Vec<String>>,
    attrs: HashMap<PathBuf, String>,
}

impl MockDeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory entry at `dir/name`.
    pub fn entry(&mut self, dir: impl AsRef<Path>, name: &str) -> &mut Self {
        let names = self.dirs.entry(dir.as_ref().to_path_buf()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            names.sort();
        }
        self
    }

    /// Create an empty directory.
    pub fn dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.dirs.entry(dir.as_ref().to_path_buf()).or_default();
        self
    }

    /// Set an attribute value.
    pub fn attr(&mut self, path: impl AsRef<Path>, value: &str) -> &mut Self {
        self.attrs.insert(path.as_ref().to_path_buf(), value.to_string());
        self
    }

    /// Register a netdev under `class/net`.
    pub fn netdev(&mut self, name: &str) -> &mut Self {
        self.entry("class/net", name)
    }

    /// Register a PF with `numvfs` VFs named by `vfs` (None = VF netdev not visible).
    pub fn pf(&mut self, pf: &str, switch_id: &str, vfs: &[Option<&str>]) -> &mut Self {
        self.netdev(pf);
        self.attr(net_path(pf).join("phys_switch_id"), switch_id);
        self.attr(
            net_path(pf).join("device/sriov_numvfs"),
            &vfs.len().to_string(),
        );
        for (index, vf) in vfs.iter().enumerate() {
            let dir = net_path(pf).join(format!("device/virtfn{index}/net"));
            self.dir(&dir);
            if let Some(vf) = vf {
                self.entry(&dir, vf);
                self.netdev(vf);
                self.entry(net_path(vf).join("device/physfn/net"), pf);
            }
        }
        self
    }

    /// Bind a netdev to a PCI address.
    pub fn pci(&mut self, pci: &str, netdev: &str) -> &mut Self {
        self.entry(Path::new("bus/pci/devices").join(pci).join("net"), netdev)
    }

    /// Register a representor.
    pub fn representor(&mut self, name: &str, switch_id: &str, port_name: &str) -> &mut Self {
        self.netdev(name);
        self.attr(net_path(name).join("phys_switch_id"), switch_id);
        self.attr(net_path(name).join("phys_port_name"), port_name)
    }
}

impl DeviceTree for MockDeviceTree {
    fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        self.attrs
            .get(path)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}
