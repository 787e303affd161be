//! ovnk CNI server library
//!
//! The node daemon that does the privileged half of pod networking: it waits
//! for the pod's network annotation, builds the pod interface (veth pair or
//! SR-IOV virtual function) inside the sandbox namespace and plugs the host
//! side into the integration bridge.
//!
//! ## Request flow
//!
//! ```text
//! shim --POST /--> server --> handler --> annotations (retry)
//!                                     --> provision (netns, link, sriov)
//!                                     --> ovs (attach, shape)
//! ```
//!
//! ## Modules
//!
//! - `annotations`: pod annotation lookup and bandwidth parsing
//! - `retry`: exponential backoff combinator
//! - `sriov`: VF and representor discovery over sysfs
//! - `netns`, `link`: namespace switching and link operations
//! - `provision`: the interface provisioning state machine
//! - `ovs`: bridge attachment and shaping
//! - `handler`, `server`: request handling and the control socket

pub mod annotations;
pub mod config;
pub mod handler;
pub mod link;
pub mod netns;
pub mod ovs;
pub mod provision;
pub mod request;
pub mod retry;
pub mod server;
pub mod sriov;

// In-memory kernel for tests (also used by the shim's end-to-end tests).
pub mod mock;

// Re-export commonly used types
pub use handler::{CniError, Handler};
pub use provision::{InterfaceDescriptor, Provisioner};
pub use retry::Backoff;
