//! dpmock-node: per-node daemon advertising mock device plugin resources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dpmock_api::NodeResourceConfiguration;
use dpmock_node::{AppContext, ConfigSync, EngineSet, KubeNodeClient, PluginConfig, Timings};
use kube::{Api, Client};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dpmock node daemon
#[derive(Parser, Debug)]
#[command(name = "dpmock-node", version, about)]
struct Args {
    /// Name of the node this daemon runs on
    #[arg(long, env = "KUBE_NODE_NAME")]
    node_name: String,

    /// Kubelet device plugin directory
    #[arg(long, default_value = "/var/lib/kubelet/device-plugins")]
    plugin_root: PathBuf,

    /// Subdirectory of the plugin root for our sockets
    #[arg(long, default_value = "volcano")]
    plugin_dir: String,

    /// Kubelet registration socket (defaults to <plugin-root>/kubelet.sock)
    #[arg(long)]
    kubelet_socket: Option<PathBuf>,

    /// Engine and configuration sync interval in milliseconds
    #[arg(long, default_value = "1000")]
    sync_interval_ms: u64,

    /// Delay before restarting a failed plugin server in milliseconds
    #[arg(long, default_value = "5000")]
    serve_backoff_ms: u64,

    /// Device list poll interval of ListAndWatch streams in milliseconds
    #[arg(long, default_value = "1000")]
    stream_poll_ms: u64,

    /// Time limit for teardown work in seconds
    #[arg(long, default_value = "10")]
    exit_timeout_secs: u64,
}

impl Args {
    fn plugin_config(&self) -> PluginConfig {
        let mut plugin = PluginConfig::new(&self.plugin_root);
        plugin.plugin_dir = self.plugin_dir.clone();
        if let Some(socket) = &self.kubelet_socket {
            plugin.kubelet_socket = socket.clone();
        }
        plugin
    }

    fn timings(&self) -> Timings {
        Timings {
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            serve_backoff: Duration::from_millis(self.serve_backoff_ms),
            stream_poll: Duration::from_millis(self.stream_poll_ms),
            exit_timeout: Duration::from_secs(self.exit_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dpmock_node=info,tonic=warn,tower=warn,hyper=warn,kube=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let ctx = Arc::new(AppContext {
        node_name: args.node_name.clone(),
        plugin: args.plugin_config(),
        timings: args.timings(),
        node: Arc::new(KubeNodeClient::new(client.clone(), &args.node_name)),
    });

    info!(node = %ctx.node_name, plugin_root = %ctx.plugin.plugin_root.display(), "Starting dpmock-node");

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let cancel = CancellationToken::new();
    let engines = Arc::new(EngineSet::new(Arc::clone(&ctx), cancel.clone()));
    let sync = ConfigSync::start(
        Arc::clone(&ctx),
        Api::<NodeResourceConfiguration>::all(client),
        Arc::clone(&engines),
        &cancel,
    );
    let sync_task = tokio::spawn(sync.run(cancel.clone()));

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    cancel.cancel();
    sync_task.await.context("Configuration sync task failed")?;
    engines.shutdown().await;

    info!("dpmock-node stopped");
    Ok(())
}
