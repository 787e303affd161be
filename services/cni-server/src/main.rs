//! ovnk CNI server
//!
//! Privileged node daemon behind the `ovn-k8s-cni-overlay` plugin. The plugin
//! forwards every CNI call here over a root-owned Unix socket; this process
//! does the namespace, link and bridge work.
//!
//! ## Architecture
//!
//! - **Server**: HTTP over the control socket, one task per request
//! - **Handler**: decodes the call, waits for the pod annotation, provisions
//! - **Provisioner**: veth or SR-IOV VF setup inside the pod namespace
//! - **Ovs**: bridge port attachment and bandwidth shaping

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ovnk_cni_server::annotations::KubeClient;
use ovnk_cni_server::config::Config;
use ovnk_cni_server::handler::Handler;
use ovnk_cni_server::link::IpRoute2;
use ovnk_cni_server::netns::ThreadNetns;
use ovnk_cni_server::ovs::{Ovs, OvsVsctl};
use ovnk_cni_server::provision::Provisioner;
use ovnk_cni_server::server;
use ovnk_cni_server::sriov::Sysfs;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    config.validate()?;
    info!(
        socket = %config.socket.display(),
        bridge = %config.bridge,
        mtu = config.mtu,
        kube_api = %config.kube_api,
        "Starting CNI server"
    );

    let annotations = KubeClient::new(
        &config.kube_api,
        config.kube_token_file.as_deref().filter(|p| p.exists()),
        config.kube_ca_file.as_deref(),
    )
    .context("failed to create Kubernetes client")?;

    let provisioner = Provisioner::new(
        Arc::new(IpRoute2::new()),
        Arc::new(ThreadNetns::new()),
        Arc::new(Sysfs::new(&config.sysfs_root)),
    );
    let ovs = Ovs::new(Arc::new(OvsVsctl::new()), config.bridge.clone());
    let handler = Arc::new(Handler::new(
        Arc::new(annotations),
        provisioner,
        ovs,
        config.mtu,
    ));

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
    };

    match config.listen_tcp {
        Some(addr) => {
            let listener = std::net::TcpListener::bind(addr)
                .with_context(|| format!("failed to bind {addr}"))?;
            server::serve_tcp(handler, listener, shutdown).await?;
        }
        None => server::serve_unix(handler, &config.socket, shutdown).await?,
    }

    info!("CNI server shutdown complete");
    Ok(())
}
