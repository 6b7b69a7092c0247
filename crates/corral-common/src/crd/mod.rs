//! Custom resource definitions managed by the corral controllers

mod cluster;
mod machine;
pub mod provider_config;
mod types;

pub use cluster::{ApiEndpoint, Cluster, ClusterNetworkingConfig, ClusterSpec, ClusterStatus, NetworkRanges};
pub use machine::{ContainerRuntimeInfo, Machine, MachineSpec, MachineStatus, MachineVersionInfo};
pub use provider_config::{
    Disk, DiskInitializeParams, GceClusterProviderConfig, GceMachineProviderConfig,
    ProviderConfigKind,
};
pub use types::{set_condition, Condition, ConditionStatus, ErrorReason, MachineRole, ProviderConfig};

/// API group of the Cluster and Machine kinds
pub const API_GROUP: &str = "cluster.k8s.io";

/// `apiVersion` of the Cluster and Machine kinds
pub const API_VERSION: &str = "cluster.k8s.io/v1alpha1";

/// Label on a Machine naming the Cluster it belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";
