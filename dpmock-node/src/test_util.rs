//! Test doubles for the node object and the kubelet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::context::{AppContext, PluginConfig, Timings};
use crate::error::NodeError;
use crate::node::NodeClient;
use crate::proto::registration_server::{Registration, RegistrationServer};
use crate::proto::{Empty, RegisterRequest};

/// How long the `wait_for_*` helpers poll before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// [`NodeClient`] that records patches instead of sending them.
#[derive(Default)]
pub struct RecordingNodeClient {
    labels: Mutex<BTreeMap<String, String>>,
    patches: Mutex<Vec<String>>,
    status_patches: Mutex<Vec<Value>>,
    fail_remaining: AtomicUsize,
    failed: AtomicUsize,
}

impl RecordingNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_labels(&self, labels: &[(&str, &str)]) {
        *lock(&self.labels) = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    /// Make the next `count` calls to `patch` fail.
    pub fn fail_next_patches(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Successfully applied patches, in order.
    pub fn patches(&self) -> Vec<String> {
        lock(&self.patches).clone()
    }

    pub fn failed_patches(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn status_patches(&self) -> Vec<Value> {
        lock(&self.status_patches).clone()
    }

    /// Wait until at least `count` patches were applied.
    pub async fn wait_for_patches(&self, count: usize) -> bool {
        wait_until(|| lock(&self.patches).len() >= count).await
    }

    /// Wait until at least `count` status patches were applied.
    pub async fn wait_for_status_patches(&self, count: usize) -> bool {
        wait_until(|| lock(&self.status_patches).len() >= count).await
    }

    fn injected_failure(&self) -> NodeError {
        NodeError::Patch {
            name: "test-node".to_string(),
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "injected failure".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }),
        }
    }
}

#[async_trait]
impl NodeClient for RecordingNodeClient {
    async fn labels(&self) -> Result<BTreeMap<String, String>, NodeError> {
        Ok(lock(&self.labels).clone())
    }

    async fn patch(&self, patch: &str) -> Result<(), NodeError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(self.injected_failure());
        }
        lock(&self.patches).push(patch.to_string());
        Ok(())
    }

    async fn patch_status(&self, patch: &Value) -> Result<(), NodeError> {
        lock(&self.status_patches).push(patch.clone());
        Ok(())
    }
}

/// Poll `condition` every few milliseconds until it holds or the wait limit
/// passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Context with a plugin root under `dir` and fast timings.
pub fn test_context(dir: &Path, node: Arc<RecordingNodeClient>) -> Arc<AppContext> {
    Arc::new(AppContext {
        node_name: "test-node".to_string(),
        plugin: PluginConfig::new(dir),
        timings: Timings {
            sync_interval: Duration::from_millis(20),
            serve_backoff: Duration::from_millis(50),
            stream_poll: Duration::from_millis(10),
            exit_timeout: Duration::from_secs(1),
        },
        node,
    })
}

struct FakeRegistration {
    requests: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for FakeRegistration {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        let _ = self.requests.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint on a Unix socket. Stops when dropped.
pub struct FakeKubelet {
    socket_path: PathBuf,
    requests: mpsc::UnboundedReceiver<RegisterRequest>,
    cancel: CancellationToken,
}

impl FakeKubelet {
    pub fn start(socket_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let socket_path = socket_path.into();
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(
            Server::builder()
                .add_service(RegistrationServer::new(FakeRegistration { requests: tx }))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                }),
        );

        Ok(Self {
            socket_path,
            requests: rx,
            cancel,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Next registration request, or `None` after the wait limit.
    pub async fn next_registration(&mut self) -> Option<RegisterRequest> {
        tokio::time::timeout(WAIT_LIMIT, self.requests.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
