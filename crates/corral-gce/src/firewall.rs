//! Cluster firewall rules
//!
//! Each rule moves from absent to present once. The marker on the Cluster is
//! the fast path; the rule list from the API is the authority when the marker
//! is missing. Marker writes are best effort: losing one only costs a list
//! call on the next pass.

use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_cluster::KubeClient;
use corral_common::crd::Cluster;
use corral_common::markers::{self, Marker};
use corral_common::retry::{cancellable, PollConfig};
use corral_common::Error;

use crate::compute::{wait_for_operation, ComputeService, Firewall, FirewallAllowed};
use crate::records::{persist_cluster, MarkerChange};

/// Network every rule and instance is attached to
pub const DEFAULT_NETWORK: &str = "global/networks/default";

/// Tag on instances that serve HTTPS
pub const HTTPS_SERVER_TAG: &str = "https-server";

const INTERNAL_PROTOCOLS: &[&str] = &["tcp", "udp", "icmp", "esp", "ah", "sctp"];

/// HTTP status the compute API returns when a resource already exists
const ALREADY_EXISTS: u16 = 409;

/// Tag carried by every instance of the cluster
pub fn worker_tag(cluster_name: &str) -> String {
    format!("{cluster_name}-worker")
}

/// One of the two rules every cluster gets
///
/// Rule names carry the cluster name; markers carry only the rule's suffix,
/// so the annotation key stays the same length for any cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterRule {
    /// Traffic between cluster instances
    Internal,
    /// Public HTTPS to masters
    Https,
}

impl ClusterRule {
    /// Both rules, in creation order
    pub const ALL: [ClusterRule; 2] = [ClusterRule::Internal, ClusterRule::Https];

    /// Part of the rule name after `<cluster>-`
    pub fn suffix(self) -> &'static str {
        match self {
            ClusterRule::Internal => "allow-cluster-internal",
            ClusterRule::Https => "allow-https",
        }
    }

    /// Rule name for `cluster_name`
    pub fn name(self, cluster_name: &str) -> String {
        format!("{cluster_name}-{}", self.suffix())
    }

    /// Marker recording that the rule exists
    pub fn marker(self) -> Marker<'static> {
        Marker::FirewallRule(self.suffix())
    }

    /// Rule body for `cluster`
    pub fn firewall(self, cluster: &Cluster) -> Firewall {
        let name = cluster.name_any();
        match self {
            ClusterRule::Internal => {
                let pod_ranges = cluster.spec.cluster_network.pods.cidr_blocks.clone();
                // Without pod ranges, scope the internal rule by tag rather than open it to all sources
                let source_tags = if pod_ranges.is_empty() {
                    vec![worker_tag(&name)]
                } else {
                    Vec::new()
                };
                Firewall {
                    name: self.name(&name),
                    network: DEFAULT_NETWORK.to_string(),
                    allowed: INTERNAL_PROTOCOLS
                        .iter()
                        .map(|p| FirewallAllowed {
                            ip_protocol: p.to_string(),
                            ports: Vec::new(),
                        })
                        .collect(),
                    direction: Some("INGRESS".to_string()),
                    source_ranges: pod_ranges,
                    source_tags,
                    target_tags: vec![worker_tag(&name)],
                }
            }
            ClusterRule::Https => Firewall {
                name: self.name(&name),
                network: DEFAULT_NETWORK.to_string(),
                allowed: vec![FirewallAllowed {
                    ip_protocol: "tcp".to_string(),
                    ports: vec!["443".to_string()],
                }],
                direction: Some("INGRESS".to_string()),
                source_ranges: vec!["0.0.0.0/0".to_string()],
                source_tags: Vec::new(),
                target_tags: vec![HTTPS_SERVER_TAG.to_string()],
            },
        }
    }
}

/// Inserts and deletes cluster firewall rules
pub struct FirewallReconciler {
    compute: Arc<dyn ComputeService>,
    kube: Arc<dyn KubeClient>,
    poll: PollConfig,
}

impl FirewallReconciler {
    /// Build a reconciler polling operations with `poll`
    pub fn new(compute: Arc<dyn ComputeService>, kube: Arc<dyn KubeClient>, poll: PollConfig) -> Self {
        Self { compute, kube, poll }
    }

    /// Make sure `rule` exists; returns whether this call inserted it
    #[instrument(skip(self, cluster, cancel), fields(cluster = %cluster.name_any()))]
    pub async fn ensure(
        &self,
        cluster: &mut Cluster,
        project: &str,
        rule: ClusterRule,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let marker = rule.marker();
        if markers::is_present(cluster, marker) {
            return Ok(false);
        }
        let rule = rule.firewall(cluster);

        let existing = cancellable(cancel, "firewalls.list", self.compute.firewalls_get(project)).await?;
        if existing.iter().any(|r| r.name == rule.name) {
            info!("rule already exists, recording marker");
            self.mark(cluster, marker).await;
            return Ok(false);
        }

        match cancellable(cancel, "firewalls.insert", self.compute.firewalls_insert(project, &rule)).await {
            Ok(op) => wait_for_operation(self.compute.as_ref(), project, op, &self.poll, cancel).await?,
            Err(Error::Compute {
                code: Some(ALREADY_EXISTS),
                ..
            }) => {
                info!("rule was inserted concurrently");
                self.mark(cluster, marker).await;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        info!("firewall rule created");
        self.mark(cluster, marker).await;
        Ok(true)
    }

    /// Delete `rule`; a rule that does not exist counts as deleted
    #[instrument(skip(self, cluster, cancel), fields(cluster = %cluster.name_any()))]
    pub async fn delete(
        &self,
        cluster: &mut Cluster,
        project: &str,
        rule: ClusterRule,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let name = rule.name(&cluster.name_any());
        match cancellable(cancel, "firewalls.delete", self.compute.firewalls_delete(project, &name)).await {
            Ok(op) => {
                match wait_for_operation(self.compute.as_ref(), project, op, &self.poll, cancel).await {
                    Ok(()) => info!("firewall rule deleted"),
                    Err(Error::OperationFailed { message, .. }) if message.contains("NOT_FOUND") => {
                        info!("firewall rule already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.is_not_found() => info!("firewall rule does not exist"),
            Err(e) => return Err(e),
        }

        let marker = rule.marker();
        if markers::get(cluster, marker).is_some() {
            if let Err(e) =
                persist_cluster(self.kube.as_ref(), cluster, &[MarkerChange::Clear(marker)]).await
            {
                warn!(error = %e, "failed to clear firewall marker");
            }
        }
        Ok(())
    }

    async fn mark(&self, cluster: &mut Cluster, marker: Marker<'_>) {
        let change = MarkerChange::Set(marker, markers::PRESENT.to_string());
        if let Err(e) = persist_cluster(self.kube.as_ref(), cluster, &[change]).await {
            warn!(error = %e, "failed to record firewall marker; next pass will list rules again");
        }
    }
}
