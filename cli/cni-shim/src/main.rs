//! ovn-k8s-cni-overlay
//!
//! CNI plugin exec'd by the container runtime. Forwards the call to the node
//! CNI server and prints its result. Logs go to stderr; stdout belongs to the
//! runtime.

use ovnk_cni_types::env_map;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use ovnk_cni_shim::config::process_env;
use ovnk_cni_shim::error::print_error;
use ovnk_cni_shim::plugin::COMMAND_ENV;
use ovnk_cni_shim::{Invocation, ServerClient, ShimConfig, ShimError};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = process_env();
    let vars = env_map(&env);

    let mut stdin = Vec::new();
    if vars.get(COMMAND_ENV).map(String::as_str) != Some("VERSION") {
        if let Err(e) = tokio::io::stdin().read_to_end(&mut stdin).await {
            fail(&Invocation::new(env, Vec::new()).cni_version(), ShimError::Stdin(e));
        }
    }

    let invocation = Invocation::new(env, stdin);
    let cni_version = invocation.cni_version();

    let config = match ShimConfig::from_vars(&vars) {
        Ok(config) => config,
        Err(e) => fail(&cni_version, ShimError::Setup(e)),
    };
    let client = ServerClient::new(config.endpoint);

    match invocation.run(&client).await {
        Ok(Some(output)) => println!("{output}"),
        Ok(None) => {}
        Err(e) => fail(&cni_version, e),
    }
}

fn fail(cni_version: &str, err: ShimError) -> ! {
    tracing::error!(error = %err, "CNI request failed");
    print_error(cni_version, &err);
    std::process::exit(1);
}
