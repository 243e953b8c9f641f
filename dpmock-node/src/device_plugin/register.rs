//! Kubelet registration and node-side deregistration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::error::PluginError;
use crate::proto::registration_client::RegistrationClient;
use crate::proto::{DevicePluginOptions, RegisterRequest, VERSION};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a gRPC channel over a Unix socket.
pub async fn connect_unix(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path = path.to_path_buf();
    // The URI is ignored, the connector dials the socket
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
}

/// Registration request announcing `endpoint` for `resource_name`.
pub fn register_request(resource_name: &str, endpoint: &str) -> RegisterRequest {
    RegisterRequest {
        version: VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }),
    }
}

/// Register with kubelet listening on `kubelet_socket`.
pub async fn register(kubelet_socket: &Path, request: RegisterRequest) -> Result<(), PluginError> {
    let channel = connect_unix(kubelet_socket)
        .await
        .map_err(|source| PluginError::Connect {
            path: PathBuf::from(kubelet_socket),
            source,
        })?;

    let resource = request.resource_name.clone();
    debug!(resource = %resource, endpoint = %request.endpoint, "Registering with kubelet");

    let mut client = RegistrationClient::new(channel);
    tokio::time::timeout(REGISTER_TIMEOUT, client.register(request))
        .await
        .map_err(|_| PluginError::RegisterTimeout(resource.clone()))?
        .map_err(|status| PluginError::Register { resource, status })?;
    Ok(())
}

/// Node status patch that drops the resource from capacity and allocatable.
pub fn deregister_patch(resource_name: &str) -> Value {
    json!({
        "status": {
            "allocatable": { resource_name: null },
            "capacity": { resource_name: null },
        }
    })
}
