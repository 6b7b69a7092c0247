//! Idempotency markers recorded on resources
//!
//! A marker states that an external side effect already happened (a firewall
//! rule was inserted, a service account was created). Markers are stored as
//! annotations under [`ANNOTATION_PREFIX`], but callers only ever address them
//! through [`Marker`], so keys are built in exactly one place.

use kube::ResourceExt;

/// Prefix of every annotation key written by the GCE actuators
pub const ANNOTATION_PREFIX: &str = "gce.clusterapi.k8s.io/";

/// Value stored for boolean markers
pub const PRESENT: &str = "true";

/// A single idempotency record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Firewall rule exists; carries the rule suffix, not the full rule name
    FirewallRule(&'a str),
    /// Service account created for the given role prefix; value is its email
    ServiceAccount(&'a str),
    /// Key for the given role prefix was imported as a secret
    Credentials(&'a str),
    /// Project the cluster infrastructure was provisioned in
    ClusterProject,
    /// Project of the instance backing a machine
    InstanceProject,
    /// Zone of the instance backing a machine
    InstanceZone,
    /// Name of the instance backing a machine
    InstanceName,
}

impl Marker<'_> {
    /// Annotation key for this marker
    pub fn key(&self) -> String {
        match self {
            Marker::FirewallRule(rule) => format!("{ANNOTATION_PREFIX}firewall-{rule}"),
            Marker::ServiceAccount(prefix) => {
                format!("{ANNOTATION_PREFIX}service-account-{prefix}")
            }
            Marker::Credentials(prefix) => format!("{ANNOTATION_PREFIX}credentials-{prefix}"),
            Marker::ClusterProject => format!("{ANNOTATION_PREFIX}cluster-project"),
            Marker::InstanceProject => format!("{ANNOTATION_PREFIX}gcp-project"),
            Marker::InstanceZone => format!("{ANNOTATION_PREFIX}gcp-zone"),
            Marker::InstanceName => format!("{ANNOTATION_PREFIX}gcp-name"),
        }
    }
}

/// Read a marker value
pub fn get<'r, K: ResourceExt>(resource: &'r K, marker: Marker<'_>) -> Option<&'r str> {
    resource
        .annotations()
        .get(&marker.key())
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Whether a boolean marker is set
pub fn is_present<K: ResourceExt>(resource: &K, marker: Marker<'_>) -> bool {
    get(resource, marker) == Some(PRESENT)
}

/// Record a marker value
pub fn set<K: ResourceExt>(resource: &mut K, marker: Marker<'_>, value: impl Into<String>) {
    resource.annotations_mut().insert(marker.key(), value.into());
}

/// Remove a marker; returns whether it was present
pub fn clear<K: ResourceExt>(resource: &mut K, marker: Marker<'_>) -> bool {
    resource.annotations_mut().remove(&marker.key()).is_some()
}
