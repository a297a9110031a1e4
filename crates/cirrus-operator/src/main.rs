//! Cirrus operator - EC2 node provisioning for Kubernetes

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use kube::{Client, CustomResourceExt};

use cirrus_cloud::fake::{MemoryEc2, MemoryIam, MemoryPricing, MemoryQueue};
use cirrus_common::crd::{Ec2NodeClass, NodeClaim};
use cirrus_common::telemetry::{init_telemetry, TelemetryConfig};
use cirrus_common::Settings;
use cirrus_operator::{install_crds, run_controllers, CloudClients};

/// Which cloud binding to wire the capability interfaces to.
///
/// The network binding ships out-of-tree: anything implementing the four
/// `cirrus-cloud` traits plugs into `run_controllers` unchanged. The
/// in-memory binding exists for demo clusters and end-to-end tests.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CloudBinding {
    /// Deterministic in-process cloud, no network calls
    Memory,
}

/// Cirrus - CRD-driven node provisioning for Kubernetes on EC2
#[derive(Parser, Debug)]
#[command(name = "cirrus-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Cloud binding to run against
    #[arg(long, value_enum, default_value = "memory")]
    cloud: CloudBinding,
}

fn build_clouds(binding: CloudBinding) -> CloudClients {
    match binding {
        CloudBinding::Memory => CloudClients {
            ec2: Arc::new(MemoryEc2::new()),
            iam: Arc::new(MemoryIam::new()),
            pricing: Arc::new(MemoryPricing::new()),
            queue: Arc::new(MemoryQueue::new()),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&Ec2NodeClass::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&NodeClaim::crd())?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "cirrus-operator".to_string(),
        ..Default::default()
    })?;

    // Fatal startup misconfiguration aborts with non-zero; reconcilers
    // themselves never exit the process
    let settings = Settings::from_env()?;
    tracing::info!(
        cluster = %settings.cluster_name,
        region = %settings.region,
        interruption_queue = settings.interruption_queue.as_deref().unwrap_or("<disabled>"),
        "starting cirrus-operator"
    );

    let client = Client::try_default().await?;
    install_crds(&client).await?;

    let clouds = build_clouds(cli.cloud);
    run_controllers(client, clouds, settings).await;

    Ok(())
}
