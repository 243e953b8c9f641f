//! Kubelet device plugin server for a single mock resource.

pub mod list_monitor;
pub mod register;
pub mod server;
pub mod service;

pub use list_monitor::ListMonitor;
pub use register::{connect_unix, deregister_patch};
pub use server::PluginServer;
pub use service::{DEVICE_IDS_ENV, DevicePluginService};
