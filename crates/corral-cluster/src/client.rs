//! Resource client used by the controllers and actuators
//!
//! Writes carry the `resourceVersion` the caller read, so a write that races
//! another writer fails with [`Error::Conflict`] instead of overwriting it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;

use corral_common::crd::{Cluster, Machine, CLUSTER_NAME_LABEL};
use corral_common::{Error, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

/// Trait abstracting Kubernetes reads and writes of corral resources
///
/// Allows mocking the Kubernetes client in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Cluster, `None` if it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error>;

    /// List the Clusters in a namespace
    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, Error>;

    /// Get a Machine, `None` if it does not exist
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// List the Machines labelled as belonging to a Cluster
    async fn list_cluster_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error>;

    /// Replace metadata and spec of a Cluster; returns the stored object
    async fn replace_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace the status of a Cluster; returns the stored object
    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace metadata and spec of a Machine; returns the stored object
    async fn replace_machine(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Replace the status of a Machine; returns the stored object
    async fn replace_machine_status(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Create or update a Secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a Secret; succeeds if it does not exist
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String, Error> {
    obj.namespace()
        .ok_or_else(|| Error::validation_for(obj.name_any(), "resource has no namespace"))
}

/// Status write guarded by the resourceVersion in the patch body
fn status_patch<S: Serialize>(
    resource_version: Option<String>,
    status: &Option<S>,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_cluster_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn replace_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace_of(cluster)?);
        api.replace(&name, &PostParams::default(), cluster)
            .await
            .map_err(|e| Error::from_kube_write("Cluster", &name, e))
    }

    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace_of(cluster)?);
        let patch = status_patch(cluster.resource_version(), &cluster.status);
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube_write("Cluster", &name, e))
    }

    async fn replace_machine(&self, machine: &Machine) -> Result<Machine, Error> {
        let name = machine.name_any();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace_of(machine)?);
        api.replace(&name, &PostParams::default(), machine)
            .await
            .map_err(|e| Error::from_kube_write("Machine", &name, e))
    }

    async fn replace_machine_status(&self, machine: &Machine) -> Result<Machine, Error> {
        let name = machine.name_any();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace_of(machine)?);
        let patch = status_patch(machine.resource_version(), &machine.status);
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube_write("Machine", &name, e))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace_of(secret)?);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == corral_common::error::NOT_FOUND => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
