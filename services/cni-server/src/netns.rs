//! Running work inside a pod network namespace.
//!
//! `setns()` switches only the calling OS thread. Namespace work therefore
//! never runs on a runtime worker: each block gets its own short-lived
//! thread, which restores the original namespace and exits.

use std::fs::File;
use std::path::Path;

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use crate::link::LinkError;

/// Namespace-scoped work.
pub type NetnsWork<'a> = Box<dyn FnOnce() -> Result<(), LinkError> + Send + 'a>;

/// Executes closures inside a network namespace.
pub trait NetnsExec: Send + Sync {
    /// Fail unless `path` refers to an openable namespace.
    fn check(&self, path: &Path) -> Result<(), LinkError>;

    /// Run `work` with `path` as the current network namespace.
    fn run_in<'a>(&self, path: &Path, work: NetnsWork<'a>) -> Result<(), LinkError>;
}

/// Run `work` inside `path` and hand back its value.
pub fn in_netns<T, F>(exec: &dyn NetnsExec, path: &Path, work: F) -> Result<T, LinkError>
where
    T: Send,
    F: FnOnce() -> Result<T, LinkError> + Send,
{
    let mut value = None;
    let slot = &mut value;
    exec.run_in(
        path,
        Box::new(move || {
            *slot = Some(work()?);
            Ok(())
        }),
    )?;
    value.ok_or_else(|| LinkError::Netns {
        path: path.display().to_string(),
        reason: "namespace work produced no result".to_string(),
    })
}

/// [`NetnsExec`] that switches a dedicated thread with `setns`.
#[derive(Debug, Clone, Default)]
pub struct ThreadNetns;

impl ThreadNetns {
    pub fn new() -> Self {
        Self
    }
}

const SELF_NETNS: &str = "/proc/thread-self/ns/net";

fn netns_error(path: &Path, reason: impl ToString) -> LinkError {
    LinkError::Netns {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl NetnsExec for ThreadNetns {
    fn check(&self, path: &Path) -> Result<(), LinkError> {
        File::open(path)
            .map(drop)
            .map_err(|e| netns_error(path, e))
    }

    fn run_in<'a>(&self, path: &Path, work: NetnsWork<'a>) -> Result<(), LinkError> {
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let saved = File::open(SELF_NETNS).map_err(|e| netns_error(path, e))?;
                    let target = File::open(path).map_err(|e| netns_error(path, e))?;

                    setns(&target, CloneFlags::CLONE_NEWNET)
                        .map_err(|e| netns_error(path, format!("setns failed: {e}")))?;
                    debug!(netns = %path.display(), "Entered network namespace");

                    let result = work();

                    if let Err(e) = setns(&saved, CloneFlags::CLONE_NEWNET) {
                        error!(netns = %path.display(), error = %e, "Failed to restore network namespace");
                        return Err(netns_error(path, format!("failed to restore namespace: {e}")));
                    }
                    result
                })
                .join()
                .map_err(|_| netns_error(path, "namespace thread panicked"))?
        })
    }
}
