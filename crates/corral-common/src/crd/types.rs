//! Types shared by the Cluster and Machine resources

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Opaque provider-specific configuration embedded in a spec
///
/// The payload is decoded by [`crate::crd::provider_config`], never read directly.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Inline provider config carrying its own `apiVersion` and `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
}

impl ProviderConfig {
    /// Wrap an already-encoded config
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

/// Schema for free-form objects: the API server keeps every field
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Role a machine plays in its cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MachineRole {
    /// Control plane node
    Master,
    /// Worker node
    Node,
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "Master"),
            Self::Node => write!(f, "Node"),
        }
    }
}

/// Machine-readable reason written to `status.errorReason`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ErrorReason {
    /// The spec or provider config cannot be used as written
    InvalidConfiguration,
    /// The spec asks for a change the actuator cannot make
    UnsupportedChange,
    /// Create failed permanently
    CreateError,
    /// Update failed permanently
    UpdateError,
    /// Delete failed permanently
    DeleteError,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::UnsupportedChange => "UnsupportedChange",
            Self::CreateError => "CreateError",
            Self::UpdateError => "UpdateError",
            Self::DeleteError => "DeleteError",
        };
        f.write_str(s)
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready)
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False, or Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Replace the condition of the same type, keeping its transition time when
/// the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_schema_preserves_unknown_fields() {
        let schema = schemars::schema_for!(ProviderConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("x-kubernetes-preserve-unknown-fields"));
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_is_unchanged() {
        let mut conditions = vec![Condition::new(
            "Ready",
            ConditionStatus::True,
            "Created",
            "first",
        )];
        let first_time = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Updated", "second"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(conditions[0].last_transition_time, first_time);

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "CreateError", "third"),
        );
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn machine_roles_serialize_as_pascal_case() {
        let json = serde_json::to_string(&vec![MachineRole::Master, MachineRole::Node]).unwrap();
        assert_eq!(json, r#"["Master","Node"]"#);
    }
}
