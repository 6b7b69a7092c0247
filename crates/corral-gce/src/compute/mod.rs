//! Compute API surface used by the actuators
//!
//! [`ComputeService`] is the seam between actuator logic and the GCE REST API;
//! [`rest::GceComputeClient`] is the production implementation. The types
//! below carry only the fields the actuators read or write, serialized the way
//! the compute v1 API expects them.

pub mod rest;

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use corral_common::metrics;
use corral_common::retry::{poll_until, PollConfig};
use corral_common::Error;

#[cfg(test)]
use mockall::automock;

/// Status of an operation that finished
pub const OPERATION_DONE: &str = "DONE";

/// Compute v1 API calls the actuators make
///
/// `*_get` lookups of a single resource return `Ok(None)` when the API answers
/// 404. Deletes and inserts surface the 404 as an error that reports
/// [`Error::is_not_found`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// List every firewall rule in the project
    async fn firewalls_get(&self, project: &str) -> Result<Vec<Firewall>, Error>;

    /// Insert a firewall rule
    async fn firewalls_insert(&self, project: &str, rule: &Firewall) -> Result<Operation, Error>;

    /// Delete a firewall rule by name
    async fn firewalls_delete(&self, project: &str, name: &str) -> Result<Operation, Error>;

    /// Read a global operation
    async fn global_operations_get(&self, project: &str, operation: &str) -> Result<Operation, Error>;

    /// Look up an image by name
    async fn images_get(&self, project: &str, image: &str) -> Result<Option<Image>, Error>;

    /// Look up the newest image of a family
    async fn images_get_from_family(&self, project: &str, family: &str) -> Result<Option<Image>, Error>;

    /// Insert an instance
    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation, Error>;

    /// Delete an instance by name
    async fn instances_delete(&self, project: &str, zone: &str, name: &str) -> Result<Operation, Error>;

    /// Read an instance
    async fn instances_get(&self, project: &str, zone: &str, name: &str) -> Result<Option<Instance>, Error>;

    /// Read a zonal operation
    async fn zone_operations_get(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation, Error>;
}

/// Long-running operation returned by every mutating call
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name, used to poll it
    #[serde(default)]
    pub name: String,
    /// PENDING, RUNNING or DONE
    #[serde(default)]
    pub status: String,
    /// Zone URL for zonal operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// URL of the resource the operation acts on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_link: Option<String>,
    /// Errors reported once the operation is DONE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Errors attached to a finished operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationError {
    /// Individual errors
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// One operation error
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationErrorItem {
    /// Error code (QUOTA_EXCEEDED, RESOURCE_ALREADY_EXISTS, ...)
    #[serde(default)]
    pub code: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl Operation {
    /// Whether the operation reached its terminal state
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_DONE
    }

    /// Zone name for zonal operations, `None` for global ones
    pub fn zone_name(&self) -> Option<&str> {
        self.zone
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|z| !z.is_empty())
    }

    /// Turn the errors of a DONE operation into [`Error::OperationFailed`]
    pub fn into_result(self) -> Result<(), Error> {
        match self.error {
            Some(err) if !err.errors.is_empty() => {
                let message = err
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Error::operation_failed(self.name, message))
            }
            _ => Ok(()),
        }
    }
}

/// VPC firewall rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    /// Rule name, unique within the project
    pub name: String,
    /// Network URL or path
    #[serde(default)]
    pub network: String,
    /// Allowed traffic
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
    /// INGRESS or EGRESS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Source CIDR ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ranges: Vec<String>,
    /// Source instance tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tags: Vec<String>,
    /// Target instance tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_tags: Vec<String>,
}

/// Protocol and ports allowed by a firewall rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FirewallAllowed {
    /// tcp, udp, icmp, esp, ah, sctp
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    /// Ports or port ranges; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

/// Disk image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image name
    #[serde(default)]
    pub name: String,
    /// Image family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Full URL
    #[serde(default)]
    pub self_link: String,
}

/// Compute instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance name
    pub name: String,
    /// `zones/<zone>/machineTypes/<type>`
    #[serde(default)]
    pub machine_type: String,
    /// Whether the instance may forward packets it did not originate
    #[serde(default)]
    pub can_ip_forward: bool,
    /// Attached disks; the first is the boot disk
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    /// Network interfaces
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Metadata entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Network tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Service accounts available to the instance
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
    /// Lifecycle status reported by the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Full URL, set by the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

impl Instance {
    /// Last path segment of the machine type
    pub fn machine_type_name(&self) -> &str {
        self.machine_type.rsplit('/').next().unwrap_or_default()
    }
}

/// Disk attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Boot disk flag
    #[serde(default)]
    pub boot: bool,
    /// Delete the disk with the instance
    #[serde(default)]
    pub auto_delete: bool,
    /// Parameters for a disk created with the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<AttachedDiskInitializeParams>,
}

/// Parameters of a disk created with the instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskInitializeParams {
    /// Size in GB
    #[serde(with = "int64_string")]
    pub disk_size_gb: i64,
    /// `zones/<zone>/diskTypes/<type>`
    #[serde(default)]
    pub disk_type: String,
    /// Image to initialize from; empty for data disks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_image: String,
}

/// Network interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Network URL or path
    #[serde(default)]
    pub network: String,
    /// External access
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// External address configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AccessConfig {
    /// Always ONE_TO_ONE_NAT
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// Instance metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Metadata {
    /// Key/value entries
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

/// One metadata entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetadataItem {
    /// Key
    pub key: String,
    /// Value
    #[serde(default)]
    pub value: String,
}

/// Network tags
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Tags {
    /// Tag values
    #[serde(default)]
    pub items: Vec<String>,
}

/// Service account attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceAccount {
    /// Account email
    pub email: String,
    /// OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// The compute API encodes int64 fields as JSON strings
mod int64_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// Block until `operation` is DONE, then surface its errors.
///
/// Zonal operations are polled through `zone_operations_get`, everything else
/// through `global_operations_get`. An operation that is already DONE is not
/// polled at all.
#[instrument(skip(compute, operation, poll, cancel), fields(operation = %operation.name))]
pub async fn wait_for_operation(
    compute: &dyn ComputeService,
    project: &str,
    operation: Operation,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let started = Instant::now();
    let zone = operation.zone_name().map(str::to_string);
    let scope = if zone.is_some() { "zone" } else { "global" };

    let finished = if operation.is_done() {
        Ok(operation)
    } else {
        let name = operation.name.clone();
        let what = format!("operation {name}");
        poll_until(poll, cancel, &what, || {
            let name = name.clone();
            let zone = zone.clone();
            async move {
                let current = match zone {
                    Some(zone) => compute.zone_operations_get(project, &zone, &name).await?,
                    None => compute.global_operations_get(project, &name).await?,
                };
                debug!(status = %current.status, "polled operation");
                Ok(current.is_done().then_some(current))
            }
        })
        .await
    };

    let result = match &finished {
        Ok(op) if op.error.as_ref().is_some_and(|e| !e.errors.is_empty()) => "failed",
        Ok(_) => "done",
        Err(Error::Timeout { .. }) => "timeout",
        Err(Error::Cancelled { .. }) => "cancelled",
        Err(_) => "failed",
    };
    metrics::record_operation_wait(scope, result, started);

    finished?.into_result()
}
