//! Persisting marker changes on Clusters and Machines
//!
//! Actuators keep a working copy of the object they were handed, apply marker
//! changes to it, and write it back. A write that loses the optimistic
//! concurrency race is replayed on a fresh read, so a marker for a side effect
//! that already happened is not dropped because someone else touched the
//! object in between.

use kube::ResourceExt;
use tracing::debug;

use corral_cluster::KubeClient;
use corral_common::crd::{Cluster, Machine};
use corral_common::markers::{self, Marker};
use corral_common::Error;

/// Attempts per write, counting the first one
pub const MARKER_WRITE_ATTEMPTS: u32 = 3;

/// One change to a marker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerChange<'a> {
    /// Record the marker with a value
    Set(Marker<'a>, String),
    /// Drop the marker
    Clear(Marker<'a>),
}

fn apply<K: ResourceExt>(obj: &mut K, changes: &[MarkerChange<'_>]) {
    for change in changes {
        match change {
            MarkerChange::Set(marker, value) => markers::set(obj, *marker, value.clone()),
            MarkerChange::Clear(marker) => {
                markers::clear(obj, *marker);
            }
        }
    }
}

fn gone(kind: &str, name: &str) -> Error {
    Error::internal_with_context(
        "markers",
        format!("{kind} {name} disappeared while recording markers"),
    )
}

/// Apply `changes` to `cluster` and persist it; `cluster` ends up as stored
pub async fn persist_cluster(
    kube: &dyn KubeClient,
    cluster: &mut Cluster,
    changes: &[MarkerChange<'_>],
) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let mut attempt = 1;
    loop {
        apply(cluster, changes);
        match kube.replace_cluster(cluster).await {
            Ok(stored) => {
                *cluster = stored;
                return Ok(());
            }
            Err(Error::Conflict { .. }) if attempt < MARKER_WRITE_ATTEMPTS => {
                debug!(cluster = %name, attempt, "conflict recording markers, re-reading");
                *cluster = kube
                    .get_cluster(&namespace, &name)
                    .await?
                    .ok_or_else(|| gone("Cluster", &name))?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply `changes` to `machine` and persist it; `machine` ends up as stored
pub async fn persist_machine(
    kube: &dyn KubeClient,
    machine: &mut Machine,
    changes: &[MarkerChange<'_>],
) -> Result<(), Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    let mut attempt = 1;
    loop {
        apply(machine, changes);
        match kube.replace_machine(machine).await {
            Ok(stored) => {
                *machine = stored;
                return Ok(());
            }
            Err(Error::Conflict { .. }) if attempt < MARKER_WRITE_ATTEMPTS => {
                debug!(machine = %name, attempt, "conflict recording markers, re-reading");
                *machine = kube
                    .get_machine(&namespace, &name)
                    .await?
                    .ok_or_else(|| gone("Machine", &name))?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster_fixture, FakeKube};

    #[tokio::test]
    async fn conflict_is_replayed_on_a_fresh_read() {
        let kube = FakeKube::default();
        let mut stale = cluster_fixture("cluster-test", "project-name-2000");
        kube.store_cluster(stale.clone());
        // Someone else writes first; our copy is now stale
        kube.bump_cluster("cluster-test", "other.example.com/touched", "yes");

        persist_cluster(
            &kube,
            &mut stale,
            &[MarkerChange::Set(Marker::FirewallRule("r"), markers::PRESENT.to_string())],
        )
        .await
        .unwrap();

        let stored = kube.cluster("cluster-test").unwrap();
        assert!(markers::is_present(&stored, Marker::FirewallRule("r")));
        assert_eq!(stored.annotations().get("other.example.com/touched").map(String::as_str), Some("yes"));
        assert_eq!(stale.resource_version(), stored.resource_version());
    }

    #[tokio::test]
    async fn clear_removes_the_marker() {
        let kube = FakeKube::default();
        let mut cluster = cluster_fixture("cluster-test", "p");
        markers::set(&mut cluster, Marker::ServiceAccount("k8s-worker"), "w@p.iam.gserviceaccount.com");
        kube.store_cluster(cluster.clone());

        persist_cluster(&kube, &mut cluster, &[MarkerChange::Clear(Marker::ServiceAccount("k8s-worker"))])
            .await
            .unwrap();

        let stored = kube.cluster("cluster-test").unwrap();
        assert_eq!(markers::get(&stored, Marker::ServiceAccount("k8s-worker")), None);
    }
}
