//! Machine resource

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ErrorReason, MachineRole, ProviderConfig};

/// Desired state of a machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerId"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.errorReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Roles this machine plays
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    /// Provider-specific machine configuration
    #[serde(default)]
    pub provider_config: ProviderConfig,

    /// Software versions to install
    #[serde(default)]
    pub versions: MachineVersionInfo,
}

impl MachineSpec {
    /// Whether the machine runs the control plane
    pub fn is_master(&self) -> bool {
        self.roles.contains(&MachineRole::Master)
    }
}

/// Versions of the node software
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version
    #[serde(default)]
    pub kubelet: String,

    /// Control plane version (masters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,

    /// Container runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<ContainerRuntimeInfo>,
}

/// Container runtime name and version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ContainerRuntimeInfo {
    /// Runtime name (docker, containerd)
    pub name: String,
    /// Runtime version
    pub version: String,
}

/// Observed state of a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Set when reconciling hit a problem that needs operator attention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ErrorReason>,

    /// Human-readable detail for `error_reason`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Cloud identifier of the backing instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// When the controller last wrote this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}
