//! dpmock-controller: keeps the status of every NodeResourceConfiguration in
//! sync with its resolved resource descriptions.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dpmock_api::{NodeResource, NodeResourceConfiguration};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dpmock controller
#[derive(Parser, Debug)]
#[command(name = "dpmock-controller", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller against the current cluster
    Run {
        /// Retry delay after a failed reconcile, in seconds
        #[arg(long, default_value = "5")]
        requeue_secs: u64,
    },
    /// Print the CustomResourceDefinitions as YAML
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dpmock_controller=info,kube=warn,tower=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run { requeue_secs } => {
            let client = Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?;
            dpmock_controller::controller::run(client, Duration::from_secs(requeue_secs)).await;
        }
        Command::Crd => {
            let node_resource = serde_yaml::to_string(&NodeResource::crd())?;
            let configuration = serde_yaml::to_string(&NodeResourceConfiguration::crd())?;
            print!("{}---\n{}", node_resource, configuration);
        }
    }

    Ok(())
}
