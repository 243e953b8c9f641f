//! DevicePlugin gRPC service for one mock resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::list_monitor::ListMonitor;
use crate::proto::device_plugin_server::DevicePlugin;
use crate::proto::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    Empty, HEALTHY, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};

/// Environment variable carrying the allocated device IDs.
pub const DEVICE_IDS_ENV: &str = "DEV_IDS";

pub struct DevicePluginService {
    resource_name: String,
    devices: Arc<ListMonitor<String>>,
    allocations: Arc<AtomicU64>,
    poll_interval: Duration,
    /// Signalled when a ListAndWatch stream ends.
    disconnected: mpsc::Sender<()>,
    /// Ends open streams so the server can shut down.
    shutdown: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        resource_name: String,
        devices: Arc<ListMonitor<String>>,
        allocations: Arc<AtomicU64>,
        poll_interval: Duration,
        disconnected: mpsc::Sender<()>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            resource_name,
            devices,
            allocations,
            poll_interval,
            disconnected,
            shutdown,
        }
    }
}

fn device_list(ids: Vec<String>) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: ids
            .into_iter()
            .map(|id| Device {
                id,
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect(),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let resource = self.resource_name.clone();
        let devices = Arc::clone(&self.devices);
        let poll_interval = self.poll_interval;
        let disconnected = self.disconnected.clone();
        let shutdown = self.shutdown.clone();

        info!(resource = %resource, "Kubelet ListAndWatch started");

        tokio::spawn(async move {
            let mut seen = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(ids) = devices.changed_since(&mut seen) else {
                            continue;
                        };
                        let count = ids.len();
                        if tx.send(Ok(device_list(ids))).await.is_err() {
                            warn!(resource = %resource, "Failed to send device list to kubelet");
                        } else {
                            debug!(resource = %resource, devices = count, "Sent device list");
                        }
                    }
                }
            }
            info!(resource = %resource, "Kubelet ListAndWatch ended");
            let _ = disconnected.try_send(());
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let id = self.allocations.fetch_add(1, Ordering::Relaxed) + 1;
        let request = request.into_inner();

        let container_responses = request
            .container_requests
            .into_iter()
            .map(|container| {
                let ids = container.devices_ids.join(",");
                info!(resource = %self.resource_name, allocation = id, devices = %ids, "Allocate");
                ContainerAllocateResponse {
                    envs: HashMap::from([(DEVICE_IDS_ENV.to_string(), ids)]),
                    ..Default::default()
                }
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ContainerAllocateRequest;
    use tokio_stream::StreamExt;

    fn service() -> (DevicePluginService, Arc<ListMonitor<String>>, mpsc::Receiver<()>) {
        let devices = Arc::new(ListMonitor::new());
        let (tx, rx) = mpsc::channel(1);
        let service = DevicePluginService::new(
            "example.com/gpu".to_string(),
            Arc::clone(&devices),
            Arc::new(AtomicU64::new(0)),
            Duration::from_millis(10),
            tx,
            CancellationToken::new(),
        );
        (service, devices, rx)
    }

    #[tokio::test]
    async fn test_allocate_sets_env() {
        let (service, _, _) = service();
        let request = AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["dev-0".to_string(), "dev-1".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["unknown".to_string()],
                },
            ],
        };

        let response = service
            .allocate(Request::new(request))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.container_responses.len(), 2);
        assert_eq!(
            response.container_responses[0].envs.get(DEVICE_IDS_ENV),
            Some(&"dev-0,dev-1".to_string())
        );
        assert_eq!(
            response.container_responses[1].envs.get(DEVICE_IDS_ENV),
            Some(&"unknown".to_string())
        );
    }

    #[tokio::test]
    async fn test_options_and_noops() {
        let (service, _, _) = service();
        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!options.pre_start_required);

        let preferred = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert!(preferred.container_responses.is_empty());
    }

    #[tokio::test]
    async fn test_list_and_watch_pushes_updates() {
        let (service, devices, mut disconnected) = service();
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        // First poll sends even an empty list
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.devices.is_empty());

        devices.update(vec!["dev-0".to_string(), "dev-1".to_string()]);
        let second = stream.next().await.unwrap().unwrap();
        let ids: Vec<_> = second.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["dev-0", "dev-1"]);
        assert!(second.devices.iter().all(|d| d.health == HEALTHY));

        drop(stream);
        assert!(disconnected.recv().await.is_some());
    }
}
