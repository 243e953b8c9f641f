//! Application context shared by every component of the node daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::node::NodeClient;

/// Length of the random part of a plugin socket name.
const SOCKET_NAME_LEN: usize = 8;

/// Where plugin sockets live and where kubelet listens.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Kubelet device plugin directory.
    pub plugin_root: PathBuf,
    /// Subdirectory of `plugin_root` holding our sockets.
    pub plugin_dir: String,
    /// Kubelet registration socket.
    pub kubelet_socket: PathBuf,
}

impl PluginConfig {
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        let plugin_root = plugin_root.into();
        Self {
            kubelet_socket: plugin_root.join("kubelet.sock"),
            plugin_root,
            plugin_dir: "volcano".to_string(),
        }
    }

    /// A fresh socket path, `<root>/<dir>/<random>.sock`.
    pub fn new_socket_path(&self) -> PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SOCKET_NAME_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        self.plugin_root
            .join(&self.plugin_dir)
            .join(format!("{}.sock", name))
    }

    /// Endpoint announced to kubelet: `socket` relative to the plugin root.
    pub fn endpoint(&self, socket: &Path) -> String {
        socket
            .strip_prefix(&self.plugin_root)
            .unwrap_or(socket)
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string()
    }
}

/// Loop intervals and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Engine sync loop period; also the configuration sync period.
    pub sync_interval: Duration,
    /// Delay before a failed serve cycle is restarted.
    pub serve_backoff: Duration,
    /// How often a ListAndWatch stream checks for a new device list.
    pub stream_poll: Duration,
    /// Upper bound for teardown work (undo patch, deregistration).
    pub exit_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(1),
            serve_backoff: Duration::from_secs(5),
            stream_poll: Duration::from_secs(1),
            exit_timeout: Duration::from_secs(10),
        }
    }
}

/// Built once in `main`, passed by `Arc`.
pub struct AppContext {
    pub node_name: String,
    pub plugin: PluginConfig,
    pub timings: Timings,
    pub node: Arc<dyn NodeClient>,
}
