//! Corral controller - edge-device fleet control plane

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corral::controller::{error_policy, reconcile, Context};
use corral::crd::{EdgeDeployment, EdgeDevice};
use corral::events::KubeEventSink;
use corral::mtls::{KubeSecretStore, TlsConfig};
use corral::protocol::Handler;
use corral::registry::KubeRegistryAuth;
use corral::repository::{KubeDeploymentRepository, KubeDeviceRepository};
use corral::server::{serve, ServerState};
use corral::{DEFAULT_DEVICE_NAMESPACE, DEFAULT_HTTPS_PORT, DEFAULT_OPERATOR_NAMESPACE};

/// Field manager name used for server-side apply
const FIELD_MANAGER: &str = "corral-controller";

/// Corral - control plane for an edge-device fleet
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Port of the device-facing mTLS server
    #[arg(long, env = "HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT)]
    https_port: u16,

    /// Domain names the server certificate is issued for
    #[arg(long = "domain", env = "DOMAIN", default_value = "corral.local")]
    domains: Vec<String>,

    /// Namespace holding the control plane's own state (CA secret,
    /// registration client secrets)
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    operator_namespace: String,

    /// Namespace newly registered devices are created in
    #[arg(long, env = "DEVICE_NAMESPACE", default_value = DEFAULT_DEVICE_NAMESPACE)]
    device_namespace: String,

    /// Add the loopback addresses to the server certificate SANs
    #[arg(long, env = "LOCALHOST_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    localhost_enabled: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The TLS stack cannot operate without a crypto provider; fail loudly.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let device_crd = serde_yaml::to_string(&EdgeDevice::crd())?;
        let deployment_crd = serde_yaml::to_string(&EdgeDeployment::crd())?;
        println!("{device_crd}---\n{deployment_crd}");
        return Ok(());
    }

    run(cli).await
}

/// Ensure the Corral CRDs are installed.
///
/// The controller installs its own CRDs on startup with server-side apply,
/// so the CRD versions always match the running binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("installing EdgeDevice CRD");
    crds.patch(
        "edgedevices.corral.dev",
        &params,
        &Patch::Apply(&EdgeDevice::crd()),
    )
    .await?;

    tracing::info!("installing EdgeDeployment CRD");
    crds.patch(
        "edgedeployments.corral.dev",
        &params,
        &Patch::Apply(&EdgeDeployment::crd()),
    )
    .await?;

    Ok(())
}

/// Map a changed device to the deployments its marker labels reference,
/// so label edits re-trigger the affected deployments
fn deployments_for_device(device: EdgeDevice) -> Vec<ObjectRef<EdgeDeployment>> {
    let namespace = device.namespace();
    device
        .labels()
        .keys()
        .filter_map(|label| label.strip_prefix("workload/"))
        .map(|name| {
            let mut reference = ObjectRef::new(name);
            if let Some(ns) = &namespace {
                reference = reference.within(ns);
            }
            reference
        })
        .collect()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("corral controller starting");

    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    // Controller over the deployment/device repositories
    let ctx = Arc::new(Context::new(client.clone()));
    let deployments: Api<EdgeDeployment> = Api::all(client.clone());
    let devices: Api<EdgeDevice> = Api::all(client.clone());

    let deployment_controller = Controller::new(deployments, WatcherConfig::default())
        .watches(devices, WatcherConfig::default(), deployments_for_device)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(reference) => tracing::debug!(?reference, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        });

    // mTLS trust layer
    let store = Arc::new(KubeSecretStore::new(
        client.clone(),
        &cli.operator_namespace,
    ));
    let tls = Arc::new(TlsConfig::new(
        store,
        cli.domains.clone(),
        cli.localhost_enabled,
    ));
    let (server_tls, chain) = tls.init_certificates().await?;

    // One bootstrap credential per startup; leftovers are labeled for
    // operational cleanup.
    let registration_secret = tls.create_registration_client().await?;
    tracing::info!(secret = %registration_secret, "registration client ready");

    // Device-facing protocol surface
    let handler = Handler::new(
        Arc::new(KubeDeviceRepository::new(client.clone())),
        Arc::new(KubeDeploymentRepository::new(client.clone())),
        &cli.device_namespace,
        Arc::new(KubeEventSink::new(client.clone(), FIELD_MANAGER)),
        Arc::new(KubeRegistryAuth::new(client.clone())),
        Some(tls),
    );
    let state = Arc::new(ServerState { handler, chain });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.https_port));
    let api_server = serve(addr, server_tls, state);

    tokio::select! {
        _ = deployment_controller => {
            tracing::info!("deployment controller completed");
        }
        result = api_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "device API server failed");
            }
        }
    }

    tracing::info!("corral controller shutting down");
    Ok(())
}
