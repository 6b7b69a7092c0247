//! Tagged decoding of provider config blobs
//!
//! A blob is a JSON object whose `apiVersion` and `kind` select the typed
//! payload. Decoding always names the kind the caller expects; a blob tagged
//! with anything else is rejected with [`Error::Decode`] rather than coerced.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::ProviderConfig;
use crate::Error;

/// API version of the GCE provider config schemas
pub const GCE_PROVIDER_API_VERSION: &str = "gceproviderconfig/v1alpha1";

/// Every `(apiVersion, kind)` pair this build understands
pub const KNOWN_SCHEMAS: &[(&str, &str)] = &[
    (GCE_PROVIDER_API_VERSION, GceClusterProviderConfig::KIND),
    (GCE_PROVIDER_API_VERSION, GceMachineProviderConfig::KIND),
];

/// A typed provider config payload with a fixed tag
pub trait ProviderConfigKind: DeserializeOwned + Serialize {
    /// `apiVersion` the payload is tagged with
    const API_VERSION: &'static str;
    /// `kind` the payload is tagged with
    const KIND: &'static str;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeTag {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// Decode `config` as `T`, rejecting missing, unknown, or mismatched tags.
///
/// `resource` names the owning object in error messages.
pub fn decode<T: ProviderConfigKind>(resource: &str, config: &ProviderConfig) -> Result<T, Error> {
    let value = config
        .value
        .as_ref()
        .ok_or_else(|| Error::decode(resource, "providerConfig.value is not set"))?;

    let tag: TypeTag = serde_json::from_value(value.clone())
        .map_err(|e| Error::decode(resource, format!("providerConfig.value is not an object: {e}")))?;

    let (Some(api_version), Some(kind)) = (tag.api_version, tag.kind) else {
        return Err(Error::decode(
            resource,
            "providerConfig.value must set apiVersion and kind",
        ));
    };

    if !KNOWN_SCHEMAS
        .iter()
        .any(|(v, k)| *v == api_version && *k == kind)
    {
        return Err(Error::decode(
            resource,
            format!("unknown provider config type {api_version}/{kind}"),
        ));
    }

    if api_version != T::API_VERSION || kind != T::KIND {
        return Err(Error::decode(
            resource,
            format!(
                "provider config is {api_version}/{kind}, expected {}/{}",
                T::API_VERSION,
                T::KIND
            ),
        ));
    }

    serde_json::from_value(value.clone())
        .map_err(|e| Error::decode(resource, format!("invalid {}: {e}", T::KIND)))
}

/// Encode `config` with its tag into a blob
pub fn encode<T: ProviderConfigKind>(config: &T) -> Result<ProviderConfig, Error> {
    let mut value = serde_json::to_value(config)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::serialization_for_kind(T::KIND, "provider config must be an object"))?;
    object.insert("apiVersion".to_string(), T::API_VERSION.into());
    object.insert("kind".to_string(), T::KIND.into());
    Ok(ProviderConfig::from_value(value))
}

/// GCE settings shared by every machine of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GceClusterProviderConfig {
    /// GCP project that hosts the cluster
    #[serde(default)]
    pub project: String,
}

impl ProviderConfigKind for GceClusterProviderConfig {
    const API_VERSION: &'static str = GCE_PROVIDER_API_VERSION;
    const KIND: &'static str = "GCEClusterProviderConfig";
}

impl GceClusterProviderConfig {
    /// Decode and check that a project is set
    pub fn from_provider_config(resource: &str, config: &ProviderConfig) -> Result<Self, Error> {
        let decoded: Self = decode(resource, config)?;
        if decoded.project.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.providerConfig.value.project",
                "project must not be empty",
            ));
        }
        Ok(decoded)
    }
}

/// GCE settings for a single machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GceMachineProviderConfig {
    /// Zone the instance runs in
    #[serde(default)]
    pub zone: String,
    /// Machine type (n1-standard-1)
    #[serde(default)]
    pub machine_type: String,
    /// OS key used to look up the image in the machine setup table
    #[serde(default)]
    pub os: String,
    /// Disks in attach order; the first one boots
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl ProviderConfigKind for GceMachineProviderConfig {
    const API_VERSION: &'static str = GCE_PROVIDER_API_VERSION;
    const KIND: &'static str = "GCEMachineProviderConfig";
}

impl GceMachineProviderConfig {
    /// Decode and check that a zone is set
    pub fn from_provider_config(resource: &str, config: &ProviderConfig) -> Result<Self, Error> {
        let decoded: Self = decode(resource, config)?;
        if decoded.zone.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.providerConfig.value.zone",
                "zone must not be empty",
            ));
        }
        Ok(decoded)
    }
}

/// A disk to attach to the instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Parameters for creating the disk with the instance
    #[serde(default)]
    pub initialize_params: DiskInitializeParams,
}

/// Size and type of a new disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    /// Size in GB
    #[serde(default)]
    pub disk_size_gb: i64,
    /// Disk type (pd-ssd, pd-standard)
    #[serde(default)]
    pub disk_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blob(value: serde_json::Value) -> ProviderConfig {
        ProviderConfig::from_value(value)
    }

    #[test]
    fn decodes_matching_cluster_config() {
        let config = blob(json!({
            "apiVersion": "gceproviderconfig/v1alpha1",
            "kind": "GCEClusterProviderConfig",
            "project": "project-name-2000",
        }));
        let decoded = GceClusterProviderConfig::from_provider_config("default/c", &config).unwrap();
        assert_eq!(decoded.project, "project-name-2000");
    }

    #[test]
    fn rejects_mismatched_kind() {
        let config = blob(json!({
            "apiVersion": "gceproviderconfig/v1alpha1",
            "kind": "GCEMachineProviderConfig",
            "zone": "us-west5-f",
        }));
        let err = decode::<GceClusterProviderConfig>("default/c", &config).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(err.to_string().contains("expected gceproviderconfig/v1alpha1/GCEClusterProviderConfig"));
        assert!(err.is_permanent());
    }

    #[test]
    fn rejects_unknown_api_version() {
        let config = blob(json!({
            "apiVersion": "awsproviderconfig/v1alpha1",
            "kind": "GCEClusterProviderConfig",
        }));
        let err = decode::<GceClusterProviderConfig>("default/c", &config).unwrap_err();
        assert!(err.to_string().contains("unknown provider config type"));
    }

    #[test]
    fn rejects_untagged_and_missing_blobs() {
        let untagged = blob(json!({ "project": "p" }));
        assert!(matches!(
            decode::<GceClusterProviderConfig>("default/c", &untagged),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            decode::<GceClusterProviderConfig>("default/c", &ProviderConfig::default()),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            decode::<GceClusterProviderConfig>("default/c", &blob(json!("a string"))),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn rejects_payload_with_wrong_field_types() {
        let config = blob(json!({
            "apiVersion": "gceproviderconfig/v1alpha1",
            "kind": "GCEMachineProviderConfig",
            "zone": "us-west5-f",
            "disks": "not-a-list",
        }));
        assert!(matches!(
            decode::<GceMachineProviderConfig>("default/m", &config),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn encode_adds_tag() {
        let config = GceMachineProviderConfig {
            zone: "us-west5-f".to_string(),
            os: "os-name".to_string(),
            disks: vec![Disk {
                initialize_params: DiskInitializeParams {
                    disk_size_gb: 37,
                    disk_type: "pd-ssd".to_string(),
                },
            }],
            ..Default::default()
        };
        let encoded = encode(&config).unwrap();
        let value = encoded.value.as_ref().unwrap();
        assert_eq!(value["kind"], "GCEMachineProviderConfig");
        assert_eq!(value["disks"][0]["initializeParams"]["diskSizeGb"], 37);
        assert_eq!(
            GceMachineProviderConfig::from_provider_config("default/m", &encoded).unwrap(),
            config
        );
    }

    #[test]
    fn empty_project_fails_validation() {
        let encoded = encode(&GceClusterProviderConfig::default()).unwrap();
        let err = GceClusterProviderConfig::from_provider_config("default/c", &encoded).unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some(_), .. }));
    }
}
