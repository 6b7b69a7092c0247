//! Kubernetes Event recording for corral controllers.
//!
//! Controllers emit standard Kubernetes Events through the [`EventPublisher`]
//! trait so that operators can follow provisioning with
//! `kubectl describe cluster` without reading controller logs.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (one of [`reasons`])
    /// * `action` - Actuator verb that was attempted (one of [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    /// (e.g. "corral-cluster-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// Actuator create finished
    pub const CREATED: &str = "Created";
    /// Actuator update finished
    pub const UPDATED: &str = "Updated";
    /// Actuator delete finished and the finalizer was released
    pub const DELETED: &str = "Deleted";
    /// Firewall rule inserted
    pub const FIREWALL_RULE_CREATED: &str = "FirewallRuleCreated";
    /// Service account created and bound to its roles
    pub const SERVICE_ACCOUNT_CREATED: &str = "ServiceAccountCreated";
    /// Credential secret imported
    pub const CREDENTIALS_IMPORTED: &str = "CredentialsImported";
    /// Compute instance inserted
    pub const INSTANCE_CREATED: &str = "InstanceCreated";
    /// The provider config or setup tables reject this resource
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    /// The requested change cannot be applied by the actuator
    pub const UNSUPPORTED_CHANGE: &str = "UnsupportedChange";
    /// An actuator verb failed permanently
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

/// Event actions.
pub mod actions {
    /// Actuator create
    pub const CREATE: &str = "Create";
    /// Actuator update
    pub const UPDATE: &str = "Update";
    /// Actuator delete
    pub const DELETE: &str = "Delete";
}
