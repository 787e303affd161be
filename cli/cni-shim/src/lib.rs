//! ovnk CNI shim library
//!
//! The unprivileged half of the plugin: it forwards a CNI invocation to the
//! node CNI server and relays the answer to the container runtime.

pub mod client;
pub mod config;
pub mod error;
pub mod plugin;

pub use client::{ClientError, Endpoint, ServerClient};
pub use config::ShimConfig;
pub use error::ShimError;
pub use plugin::Invocation;
