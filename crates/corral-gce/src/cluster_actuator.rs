//! Cluster actuator: service accounts, credentials and firewall rules
//!
//! A cluster counts as created once every marker for the infrastructure it
//! needs is recorded on it. `create` walks the same list and skips what is
//! already marked, so a pass interrupted halfway resumes where it stopped.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_cluster::{ClusterActuator, KubeClient};
use corral_common::crd::{Cluster, GceClusterProviderConfig, Machine};
use corral_common::events::{actions, reasons, EventPublisher};
use corral_common::markers::{self, Marker};
use corral_common::retry::PollConfig;
use corral_common::Error;

use crate::compute::ComputeService;
use crate::firewall::{ClusterRule, FirewallReconciler};
use crate::iam::IamClient;
use crate::records::{persist_cluster, MarkerChange};
use crate::service_account::{AccountRole, RoleTable, ServiceAccountProvisioner};
use crate::setup::{ClusterParams, SetupSource};

fn resource_name(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

fn project_of(cluster: &Cluster) -> Result<String, Error> {
    Ok(
        GceClusterProviderConfig::from_provider_config(
            &resource_name(cluster),
            &cluster.spec.provider_config,
        )?
        .project,
    )
}

/// [`ClusterActuator`] for clusters hosted in one GCP project
pub struct GceClusterActuator {
    firewalls: FirewallReconciler,
    accounts: ServiceAccountProvisioner,
    kube: Arc<dyn KubeClient>,
    events: Arc<dyn EventPublisher>,
    roles: RoleTable,
    cluster_setup: Option<Arc<dyn SetupSource<ClusterParams>>>,
    provision_credentials: bool,
}

impl GceClusterActuator {
    /// Build an actuator provisioning node accounts and firewall rules
    pub fn new(
        compute: Arc<dyn ComputeService>,
        iam: Arc<dyn IamClient>,
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        poll: PollConfig,
    ) -> Self {
        Self {
            firewalls: FirewallReconciler::new(compute, kube.clone(), poll),
            accounts: ServiceAccountProvisioner::new(iam, kube.clone()),
            kube,
            events,
            roles: RoleTable::default(),
            cluster_setup: None,
            provision_credentials: false,
        }
    }

    /// Require every cluster project to match exactly one entry of `source`
    pub fn with_cluster_setup(mut self, source: Arc<dyn SetupSource<ClusterParams>>) -> Self {
        self.cluster_setup = Some(source);
        self
    }

    /// Also create controller accounts and import their keys as secrets
    pub fn with_credentials(mut self, enabled: bool) -> Self {
        self.provision_credentials = enabled;
        self
    }

    fn required_accounts(&self) -> Vec<&AccountRole> {
        let mut accounts: Vec<_> = self.roles.node_accounts().into_iter().collect();
        if self.provision_credentials {
            accounts.extend(self.roles.controller_accounts());
        }
        accounts
    }

    async fn notify(&self, cluster: &Cluster, reason: &str, note: String) {
        self.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reason,
                actions::CREATE,
                Some(note),
            )
            .await;
    }

    fn project_drift(cluster: &Cluster, project: &str) -> Option<Error> {
        let recorded = markers::get(cluster, Marker::ClusterProject)?;
        (recorded != project).then(|| {
            Error::unsupported(
                resource_name(cluster),
                "update",
                format!(
                    "cluster updates are not yet supported: project changed from {recorded} to {project}"
                ),
            )
        })
    }
}

#[async_trait]
impl ClusterActuator for GceClusterActuator {
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn create(
        &self,
        cluster: &Cluster,
        _machines: &[Machine],
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let project = project_of(cluster)?;
        if let Some(source) = &self.cluster_setup {
            source
                .setup_config()
                .await?
                .lookup(&ClusterParams {
                    project: project.clone(),
                })?;
        }
        if let Some(drift) = Self::project_drift(cluster, &project) {
            return Err(drift);
        }

        let mut working = cluster.clone();
        if markers::get(&working, Marker::ClusterProject).is_none() {
            persist_cluster(
                self.kube.as_ref(),
                &mut working,
                &[MarkerChange::Set(Marker::ClusterProject, project.clone())],
            )
            .await?;
        }

        for role in self.required_accounts() {
            if let Some(email) = self.accounts.ensure(&mut working, &project, role, cancel).await? {
                self.notify(&working, reasons::SERVICE_ACCOUNT_CREATED, email).await;
            }
            if self.accounts.import_credentials(&mut working, &project, role, cancel).await? {
                if let Some(secret) = &role.secret {
                    let note = format!("{}/{}", secret.namespace, secret.name);
                    self.notify(&working, reasons::CREDENTIALS_IMPORTED, note).await;
                }
            }
        }

        for rule in ClusterRule::ALL {
            if self.firewalls.ensure(&mut working, &project, rule, cancel).await? {
                let name = rule.name(&working.name_any());
                self.notify(&working, reasons::FIREWALL_RULE_CREATED, name).await;
            }
        }

        info!(%project, "cluster infrastructure provisioned");
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn delete(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<(), Error> {
        let project = match project_of(cluster) {
            Ok(project) => project,
            Err(e) => match markers::get(cluster, Marker::ClusterProject) {
                Some(recorded) => recorded.to_string(),
                None => {
                    warn!(error = %e, "no usable project, nothing to delete");
                    return Ok(());
                }
            },
        };

        let name = cluster.name_any();
        let mut working = cluster.clone();
        let mut failures = Vec::new();

        for rule in ClusterRule::ALL {
            if let Err(e) = self.firewalls.delete(&mut working, &project, rule, cancel).await {
                if matches!(e, Error::Cancelled { .. }) {
                    return Err(e);
                }
                warn!(rule = rule.suffix(), error = %e, "deleting firewall rule failed");
                failures.push(e);
            }
        }
        for role in self.roles.all() {
            if let Err(e) = self.accounts.delete(&mut working, &project, role, cancel).await {
                if matches!(e, Error::Cancelled { .. }) {
                    return Err(e);
                }
                warn!(prefix = role.prefix, error = %e, "deleting service account failed");
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            return Err(Error::partial_failure(
                format!("delete cluster {name} infrastructure"),
                failures,
            ));
        }

        if markers::get(&working, Marker::ClusterProject).is_some() {
            if let Err(e) = persist_cluster(
                self.kube.as_ref(),
                &mut working,
                &[MarkerChange::Clear(Marker::ClusterProject)],
            )
            .await
            {
                warn!(error = %e, "failed to clear project marker");
            }
        }
        info!(%project, "cluster infrastructure deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn update(&self, cluster: &Cluster, _cancel: &CancellationToken) -> Result<(), Error> {
        let project = project_of(cluster)?;
        match Self::project_drift(cluster, &project) {
            Some(drift) => Err(drift),
            None => Ok(()),
        }
    }

    async fn exists(&self, cluster: &Cluster) -> Result<bool, Error> {
        project_of(cluster)?;
        if markers::get(cluster, Marker::ClusterProject).is_none() {
            return Ok(false);
        }

        let accounts_done = self.required_accounts().into_iter().all(|role| {
            markers::get(cluster, Marker::ServiceAccount(role.prefix)).is_some()
                && (role.secret.is_none() || markers::is_present(cluster, Marker::Credentials(role.prefix)))
        });
        let rules_done = ClusterRule::ALL
            .iter()
            .all(|rule| markers::is_present(cluster, rule.marker()));

        Ok(accounts_done && rules_done)
    }
}
