//! One plugin invocation.

use ovnk_cni_types::{CniRequest, NetConf, VersionReply};
use tracing::{debug, info};

use crate::client::ServerClient;
use crate::error::ShimError;

/// The command variable set by the container runtime.
pub const COMMAND_ENV: &str = "CNI_COMMAND";

/// What the runtime handed to the plugin.
#[derive(Debug, Clone)]
pub struct Invocation {
    command: String,
    env: Vec<String>,
    stdin: Vec<u8>,
}

impl Invocation {
    /// Build from `KEY=VALUE` environment entries and the raw stdin bytes.
    pub fn new(env: Vec<String>, stdin: Vec<u8>) -> Self {
        let command = env
            .iter()
            .find_map(|entry| entry.strip_prefix(COMMAND_ENV)?.strip_prefix('='))
            .unwrap_or_default()
            .trim()
            .to_string();
        Self {
            command,
            env,
            stdin,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Result version requested in the configuration, or the newest supported one.
    pub fn cni_version(&self) -> String {
        NetConf::from_bytes(&self.stdin)
            .ok()
            .map(|conf| conf.cni_version)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| VersionReply::default().cni_version)
    }

    /// Run the invocation; returns what to print on stdout, if anything.
    pub async fn run(self, client: &ServerClient) -> Result<Option<String>, ShimError> {
        match self.command.as_str() {
            "" => Err(ShimError::MissingCommand),
            "VERSION" => serde_json::to_string(&VersionReply::default())
                .map(Some)
                .map_err(ShimError::Encode),
            command => {
                let conf = NetConf::from_bytes(&self.stdin)?;
                debug!(command, cni_version = %conf.cni_version, "Forwarding CNI request");

                let is_add = command == "ADD";
                let request = CniRequest::new(self.env, self.stdin);
                let response = client.call(&request).await?;

                if !is_add {
                    return Ok(None);
                }
                let result = response.result.ok_or(ShimError::MissingResult)?;
                info!(
                    interfaces = result.interfaces.len(),
                    ips = result.ips.len(),
                    "CNI ADD complete"
                );
                serde_json::to_string(&result)
                    .map(Some)
                    .map_err(ShimError::Encode)
            }
        }
    }
}
