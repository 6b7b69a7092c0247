//! Actuator contract between the controllers and a cloud provider
//!
//! Every verb must be idempotent: the runtime delivers reconciles at least
//! once, so a verb can run again after it partially or fully succeeded.
//! `delete` returns `Ok(())` when there is nothing left to delete.
//! `exists` only reads; it must not change cloud or resource state.
//!
//! Long-running verbs take a [`CancellationToken`] and give up with
//! [`Error::Cancelled`] once it fires.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use corral_common::crd::{Cluster, Machine};
use corral_common::Error;

#[cfg(test)]
use mockall::automock;

/// Provisions the infrastructure a cluster needs before machines can join it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterActuator: Send + Sync {
    /// Provision cluster-level infrastructure. `machines` are the cluster's
    /// current machines, for providers that size infrastructure by them.
    async fn create(
        &self,
        cluster: &Cluster,
        machines: &[Machine],
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Tear down everything `create` provisioned
    async fn delete(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<(), Error>;

    /// Converge drift between the spec and the provisioned infrastructure
    async fn update(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<(), Error>;

    /// Whether `create` already ran to completion
    async fn exists(&self, cluster: &Cluster) -> Result<bool, Error>;
}

/// Provisions the compute instance behind a machine
#[async_trait]
pub trait MachineActuator: Send + Sync {
    /// Create the instance
    async fn create(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Delete the instance. `cluster` is `None` when the owning cluster is
    /// already gone; the actuator then relies on what the machine recorded.
    async fn delete(
        &self,
        cluster: Option<&Cluster>,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Converge the instance toward the machine spec
    async fn update(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Whether the instance exists
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool, Error>;
}
