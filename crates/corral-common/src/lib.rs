//! Common types for corral: resource kinds, errors, and controller utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod markers;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for cluster-wide system secrets
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Field manager name used for every write
pub const FIELD_MANAGER: &str = "corral-controller";
