//! Per-resource device plugin server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use super::list_monitor::ListMonitor;
use super::register::{deregister_patch, register, register_request};
use super::service::DevicePluginService;
use crate::context::AppContext;
use crate::error::PluginError;
use crate::node::NodeClient;
use crate::proto::device_plugin_server::DevicePluginServer;

/// Serves the device plugin API for one resource and keeps it registered.
pub struct PluginServer {
    resource_name: String,
    socket_path: PathBuf,
    endpoint: String,
    kubelet_socket: PathBuf,
    stream_poll: Duration,
    exit_timeout: Duration,
    devices: Arc<ListMonitor<String>>,
    allocations: Arc<AtomicU64>,
    node: Arc<dyn NodeClient>,
}

impl PluginServer {
    pub fn new(resource_name: impl Into<String>, ctx: &AppContext) -> Self {
        let socket_path = ctx.plugin.new_socket_path();
        Self {
            resource_name: resource_name.into(),
            endpoint: ctx.plugin.endpoint(&socket_path),
            socket_path,
            kubelet_socket: ctx.plugin.kubelet_socket.clone(),
            stream_poll: ctx.timings.stream_poll,
            exit_timeout: ctx.timings.exit_timeout,
            devices: Arc::new(ListMonitor::new()),
            allocations: Arc::new(AtomicU64::new(0)),
            node: Arc::clone(&ctx.node),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Replace the advertised device IDs. Open streams pick the change up on
    /// their next poll.
    pub fn update_device_ids(&self, ids: Vec<String>) {
        self.devices.update(ids);
    }

    /// Bind, register with kubelet and serve until cancelled or disconnected.
    ///
    /// Returns `Ok(())` only on cancellation. Kubelet cannot resume a
    /// dropped registration, so a disconnect is an error and the caller
    /// starts over with a new cycle.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), PluginError> {
        let listener = self.bind()?;

        let (disconnected_tx, mut disconnected_rx) = mpsc::channel(1);
        let shutdown = cancel.child_token();
        let service = DevicePluginService::new(
            self.resource_name.clone(),
            Arc::clone(&self.devices),
            Arc::clone(&self.allocations),
            self.stream_poll,
            disconnected_tx,
            shutdown.clone(),
        );

        let server_shutdown = shutdown.clone();
        let mut server = tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    server_shutdown.cancelled().await
                }),
        );

        let request = register_request(&self.resource_name, &self.endpoint);
        let registered = tokio::select! {
            res = register(&self.kubelet_socket, request) => Some(res),
            _ = cancel.cancelled() => None,
        };
        let early_exit = match registered {
            Some(Ok(())) => None,
            Some(Err(e)) => Some(Err(e)),
            // Cancelled before kubelet answered, nothing to deregister
            None => {
                debug!(resource = %self.resource_name, "Cancelled during registration");
                Some(Ok(()))
            }
        };
        if let Some(result) = early_exit {
            shutdown.cancel();
            self.stop_server(server).await;
            self.remove_socket();
            return result;
        }
        info!(resource = %self.resource_name, endpoint = %self.endpoint, "Registered with kubelet");

        let result = tokio::select! {
            res = &mut server => match res {
                Ok(Ok(())) => Err(PluginError::KubeletDisconnected),
                Ok(Err(e)) => Err(PluginError::Server(e)),
                Err(e) => Err(PluginError::Join(e)),
            },
            _ = disconnected_rx.recv() => Err(PluginError::KubeletDisconnected),
            _ = cancel.cancelled() => Ok(()),
        };

        shutdown.cancel();
        if !server.is_finished() {
            self.stop_server(server).await;
        }
        self.deregister().await;
        self.remove_socket();

        result
    }

    fn bind(&self) -> Result<UnixListener, PluginError> {
        let socket_error = |source| PluginError::Socket {
            path: self.socket_path.clone(),
            source,
        };

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed stale plugin socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(socket_error(e)),
        }
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir).map_err(socket_error)?;
        }
        UnixListener::bind(&self.socket_path).map_err(socket_error)
    }

    async fn stop_server(
        &self,
        server: tokio::task::JoinHandle<Result<(), tonic::transport::Error>>,
    ) {
        let abort = server.abort_handle();
        if tokio::time::timeout(self.exit_timeout, server).await.is_err() {
            warn!(resource = %self.resource_name, "Plugin server did not stop in time, aborting");
            abort.abort();
        }
    }

    /// Best effort, bounded by the exit timeout and independent of the
    /// cancellation that ended serving.
    async fn deregister(&self) {
        let patch = deregister_patch(&self.resource_name);
        match tokio::time::timeout(self.exit_timeout, self.node.patch_status(&patch)).await {
            Ok(Ok(())) => info!(resource = %self.resource_name, "Deregistered from node"),
            Ok(Err(e)) => error!(resource = %self.resource_name, error = %e, "Failed to deregister"),
            Err(_) => error!(resource = %self.resource_name, "Deregistration timed out"),
        }
    }

    fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.socket_path.display(), error = %e, "Failed to remove plugin socket");
        }
    }
}
