//! Node daemon error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from reading or patching the local node object.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node patch is not valid JSON: {0}")]
    InvalidPatch(#[source] serde_json::Error),

    #[error("failed to get node {name}: {source}")]
    Get {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to patch node {name}: {source}")]
    Patch {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Errors that end one serve cycle of a device plugin server.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to prepare plugin socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to kubelet at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("kubelet rejected registration of {resource}: {status}")]
    Register {
        resource: String,
        status: tonic::Status,
    },

    #[error("registration of {0} timed out")]
    RegisterTimeout(String),

    #[error("device plugin server terminated: {0}")]
    Server(#[source] tonic::transport::Error),

    #[error("device plugin server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("kubelet disconnected")]
    KubeletDisconnected,
}
