//! CNI request handling.
//!
//! Turns one forwarded invocation into annotation lookups, kernel work and
//! bridge commands. Kernel and switch work is blocking and runs on the
//! blocking pool; the annotation poll stays on the runtime.

use std::sync::Arc;

use ovnk_cni_types::{validate_mtu, CniRequest, CniResponse, CniResult, ResultInterface, TypesError};
use thiserror::Error;
use tracing::{info, instrument};

use crate::annotations::{get_pod_info, AnnotationError, AnnotationStore, PodInfo};
use crate::link::LinkError;
use crate::ovs::{Ovs, OvsError, PortAttachment};
use crate::provision::{
    InterfaceDescriptor, Progress, ProvisionError, ProvisionRequest, ProvisionState, Provisioned,
    Provisioner,
};
use crate::request::{Command, PodRequest, RequestError};
use crate::retry::Backoff;

/// Transmit queue length set on shaped host interfaces.
pub const SHAPED_TXQUEUELEN: u32 = 1000;

/// Errors surfaced to the shim.
#[derive(Debug, Error)]
pub enum CniError {
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("failure in plugging pod interface: {0}")]
    Ovs(#[from] OvsError),

    #[error("failed to set host interface queue length: {0}")]
    Link(#[from] LinkError),

    #[error("invalid network configuration: {0}")]
    Mtu(#[from] TypesError),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Handles CNI requests for this node.
#[derive(Clone)]
pub struct Handler {
    annotations: Arc<dyn AnnotationStore>,
    provisioner: Provisioner,
    ovs: Ovs,
    mtu: u32,
    backoff: Backoff,
}

impl Handler {
    pub fn new(
        annotations: Arc<dyn AnnotationStore>,
        provisioner: Provisioner,
        ovs: Ovs,
        mtu: u32,
    ) -> Self {
        Self {
            annotations,
            provisioner,
            ovs,
            mtu,
            backoff: Backoff::annotation(),
        }
    }

    /// Override the annotation wait schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Handle one forwarded invocation.
    pub async fn handle(&self, request: CniRequest) -> Result<CniResponse, CniError> {
        let pr = PodRequest::from_cni(&request)?;

        match pr.command {
            Command::Add => {
                let result = self.add(pr).await?;
                Ok(CniResponse {
                    result: Some(result),
                })
            }
            Command::Del => {
                self.del(pr).await?;
                Ok(CniResponse::default())
            }
            Command::Check => Ok(CniResponse::default()),
        }
    }

    #[instrument(
        skip(self, pr),
        fields(sandbox = %pr.sandbox_id, namespace = %pr.pod_namespace, pod = %pr.pod_name)
    )]
    async fn add(&self, pr: PodRequest) -> Result<CniResult, CniError> {
        let mtu = validate_mtu(pr.conf.mtu.unwrap_or(self.mtu))?;

        let info = get_pod_info(
            self.annotations.as_ref(),
            &pr.pod_namespace,
            &pr.pod_name,
            &self.backoff,
        )
        .await?;

        let provisioner = self.provisioner.clone();
        let ovs = self.ovs.clone();
        let (pr, info, provisioned) = tokio::task::spawn_blocking(move || {
            let provisioned = setup(&provisioner, &ovs, &pr, &info, mtu)?;
            Ok::<_, CniError>((pr, info, provisioned))
        })
        .await??;

        let result = CniResult::single_address(
            &pr.conf.cni_version,
            vec![
                result_interface(&provisioned.host),
                result_interface(&provisioned.sandbox),
            ],
            info.identity.ip,
            info.identity.gateway,
        );

        info!(
            host_iface = %provisioned.host.name,
            address = %info.identity.ip,
            "Pod network ready"
        );
        Ok(result)
    }

    #[instrument(skip(self, pr), fields(sandbox = %pr.sandbox_id))]
    async fn del(&self, pr: PodRequest) -> Result<(), CniError> {
        let ovs = self.ovs.clone();
        let provisioner = self.provisioner.clone();
        tokio::task::spawn_blocking(move || {
            ovs.teardown(&pr.sandbox_id);
            provisioner.release(&pr.sandbox_id);
        })
        .await?;
        info!("Pod network torn down");
        Ok(())
    }
}

/// Provision, attach and shape. Blocking.
fn setup(
    provisioner: &Provisioner,
    ovs: &Ovs,
    pr: &PodRequest,
    info: &PodInfo,
    mtu: u32,
) -> Result<Provisioned, CniError> {
    let identity = &info.identity;
    let mut progress = Progress::new(&pr.sandbox_id);

    let provisioned = provisioner.provision(
        &ProvisionRequest {
            sandbox_id: &pr.sandbox_id,
            netns: &pr.netns,
            ifname: &pr.ifname,
            identity,
            mtu,
            device: pr.conf.device(),
        },
        &mut progress,
    )?;

    let host = &provisioned.host.name;
    ovs.attach_port(
        host,
        &PortAttachment {
            sandbox_id: &pr.sandbox_id,
            pod_namespace: &pr.pod_namespace,
            pod_name: &pr.pod_name,
            mac: identity.mac,
            ip: identity.ip,
        },
    )?;
    progress.advance(ProvisionState::Attached);

    ovs.clear_bandwidth(&pr.sandbox_id);
    if info.bandwidth.is_limited() {
        provisioner
            .links()
            .set_txqueuelen(host, SHAPED_TXQUEUELEN)?;
        ovs.set_bandwidth(&pr.sandbox_id, host, &info.bandwidth)?;
    }

    Ok(provisioned)
}

fn result_interface(iface: &InterfaceDescriptor) -> ResultInterface {
    ResultInterface {
        name: iface.name.clone(),
        mac: iface.mac.to_string(),
        sandbox: iface
            .netns
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    }
}
