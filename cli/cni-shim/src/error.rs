//! Error reporting for the plugin binary.
//!
//! The container runtime reads the plugin's stdout, so failures are printed
//! there as a CNI error document rather than as free text.

use ovnk_cni_types::{CniErrorReply, TypesError};
use thiserror::Error;

use crate::client::ClientError;

/// Plugin failures.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("invalid plugin configuration: {0:#}")]
    Setup(anyhow::Error),

    #[error("CNI_COMMAND is not set")]
    MissingCommand,

    #[error("failed to read network configuration: {0}")]
    Stdin(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] TypesError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("CNI server returned no result for ADD")]
    MissingResult,

    #[error("failed to marshal CNI result: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Build the error document for a failure.
pub fn error_reply(cni_version: &str, err: &ShimError) -> CniErrorReply {
    CniErrorReply::new(cni_version, err.to_string())
}

/// Print the error document on stdout.
pub fn print_error(cni_version: &str, err: &ShimError) {
    match serde_json::to_string(&error_reply(cni_version, err)) {
        Ok(json) => println!("{json}"),
        // Last resort; the runtime still sees a non-zero exit.
        Err(_) => eprintln!("{err}"),
    }
}
