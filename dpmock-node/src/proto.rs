//! Generated protobuf types for the kubelet device plugin API.

#![allow(clippy::enum_variant_names)]

/// Device plugin API (kubelet)
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

pub use v1beta1::*;

/// API version sent in registration requests.
pub const VERSION: &str = "v1beta1";

/// Health value of an advertised device.
pub const HEALTHY: &str = "Healthy";
