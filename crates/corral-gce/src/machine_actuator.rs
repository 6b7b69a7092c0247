//! Machine actuator backed by GCE instances
//!
//! An instance is located by the project, zone and name recorded on the
//! Machine when it was created. Machines without that record fall back to
//! what their configs say today, which is also how an instance created by an
//! earlier pass that failed to record is found again.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_cluster::{KubeClient, MachineActuator};
use corral_common::crd::{
    Cluster, GceClusterProviderConfig, GceMachineProviderConfig, Machine, MachineStatus,
};
use corral_common::markers::{self, Marker};
use corral_common::retry::{cancellable, PollConfig};
use corral_common::Error;

use crate::compute::{wait_for_operation, ComputeService};
use crate::instance::{provider_id, resolve_image, InstanceSpec};
use crate::records::{persist_machine, MarkerChange};
use crate::service_account::{default_service_account_for_machine, RoleTable};
use crate::setup::{MachineParams, SetupSource};

const ALREADY_EXISTS: u16 = 409;

/// Where an instance lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceLocation {
    /// GCP project
    pub project: String,
    /// Zone
    pub zone: String,
    /// Instance name
    pub name: String,
}

impl InstanceLocation {
    /// Location recorded on the machine, if all three parts are there
    pub fn recorded(machine: &Machine) -> Option<Self> {
        Some(Self {
            project: markers::get(machine, Marker::InstanceProject)?.to_string(),
            zone: markers::get(machine, Marker::InstanceZone)?.to_string(),
            name: markers::get(machine, Marker::InstanceName)?.to_string(),
        })
    }

    fn changes(&self) -> [MarkerChange<'static>; 3] {
        [
            MarkerChange::Set(Marker::InstanceProject, self.project.clone()),
            MarkerChange::Set(Marker::InstanceZone, self.zone.clone()),
            MarkerChange::Set(Marker::InstanceName, self.name.clone()),
        ]
    }

    fn provider_id(&self) -> String {
        provider_id(&self.project, &self.zone, &self.name)
    }
}

fn resource_name(machine: &Machine) -> String {
    format!(
        "{}/{}",
        machine.namespace().unwrap_or_default(),
        machine.name_any()
    )
}

fn cluster_project(cluster: &Cluster) -> Result<String, Error> {
    let resource = format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    );
    Ok(GceClusterProviderConfig::from_provider_config(&resource, &cluster.spec.provider_config)?.project)
}

fn machine_config(machine: &Machine) -> Result<GceMachineProviderConfig, Error> {
    GceMachineProviderConfig::from_provider_config(&resource_name(machine), &machine.spec.provider_config)
}

/// [`MachineActuator`] creating one GCE instance per Machine
pub struct GceMachineActuator {
    compute: Arc<dyn ComputeService>,
    kube: Arc<dyn KubeClient>,
    setup: Arc<dyn SetupSource<MachineParams>>,
    roles: RoleTable,
    poll: PollConfig,
}

impl GceMachineActuator {
    /// Build an actuator reading images and startup scripts from `setup`
    pub fn new(
        compute: Arc<dyn ComputeService>,
        kube: Arc<dyn KubeClient>,
        setup: Arc<dyn SetupSource<MachineParams>>,
        poll: PollConfig,
    ) -> Self {
        Self {
            compute,
            kube,
            setup,
            roles: RoleTable::default(),
            poll,
        }
    }

    fn desired_location(cluster: &Cluster, machine: &Machine) -> Result<InstanceLocation, Error> {
        Ok(InstanceLocation {
            project: cluster_project(cluster)?,
            zone: machine_config(machine)?.zone,
            name: machine.name_any(),
        })
    }

    fn location(cluster: &Cluster, machine: &Machine) -> Result<InstanceLocation, Error> {
        match InstanceLocation::recorded(machine) {
            Some(location) => Ok(location),
            None => Self::desired_location(cluster, machine),
        }
    }

    /// Record the location and provider ID unless they are already there
    async fn record(&self, machine: &Machine, location: &InstanceLocation) -> Result<(), Error> {
        let mut latest = machine.clone();
        if InstanceLocation::recorded(machine).as_ref() != Some(location) {
            persist_machine(self.kube.as_ref(), &mut latest, &location.changes()).await?;
        }

        let id = location.provider_id();
        let status = latest.status.get_or_insert_with(MachineStatus::default);
        if status.provider_id.as_deref() != Some(id.as_str()) {
            status.provider_id = Some(id);
            self.kube.replace_machine_status(&latest).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MachineActuator for GceMachineActuator {
    #[instrument(skip_all, fields(machine = %machine.name_any()))]
    async fn create(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let config = machine_config(machine)?;
        let location = InstanceLocation {
            project: cluster_project(cluster)?,
            zone: config.zone.clone(),
            name: machine.name_any(),
        };

        let existing = cancellable(
            cancel,
            "instances.get",
            self.compute
                .instances_get(&location.project, &location.zone, &location.name),
        )
        .await?;
        if existing.is_some() {
            info!(zone = %location.zone, "instance already exists");
            return self.record(machine, &location).await;
        }

        let table = self.setup.setup_config().await?;
        let params = MachineParams::for_machine(machine, &config);
        let item = table.lookup(&params)?;
        let image = cancellable(cancel, "images.get", resolve_image(self.compute.as_ref(), &item.image)).await?;

        let instance = InstanceSpec {
            cluster_name: &cluster.name_any(),
            machine,
            config: &config,
            image: &image,
            startup_script: &item.metadata.startup_script,
            service_account: default_service_account_for_machine(&self.roles, cluster, machine),
        }
        .build();

        match cancellable(
            cancel,
            "instances.insert",
            self.compute
                .instances_insert(&location.project, &location.zone, &instance),
        )
        .await
        {
            Ok(op) => {
                wait_for_operation(self.compute.as_ref(), &location.project, op, &self.poll, cancel)
                    .await?
            }
            Err(Error::Compute {
                code: Some(ALREADY_EXISTS),
                ..
            }) => info!("instance was inserted concurrently"),
            Err(e) => return Err(e),
        }

        info!(zone = %location.zone, %image, "instance created");
        self.record(machine, &location).await
    }

    #[instrument(skip_all, fields(machine = %machine.name_any()))]
    async fn delete(
        &self,
        cluster: Option<&Cluster>,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let location = match (InstanceLocation::recorded(machine), cluster) {
            (Some(location), _) => location,
            (None, Some(cluster)) => match Self::desired_location(cluster, machine) {
                Ok(location) => location,
                Err(e) => {
                    warn!(error = %e, "no recorded instance and config is unusable, nothing to delete");
                    return Ok(());
                }
            },
            (None, None) => {
                warn!("no recorded instance and cluster is gone, nothing to delete");
                return Ok(());
            }
        };

        match cancellable(
            cancel,
            "instances.delete",
            self.compute
                .instances_delete(&location.project, &location.zone, &location.name),
        )
        .await
        {
            Ok(op) => {
                match wait_for_operation(self.compute.as_ref(), &location.project, op, &self.poll, cancel)
                    .await
                {
                    Ok(()) => info!(zone = %location.zone, "instance deleted"),
                    Err(Error::OperationFailed { message, .. }) if message.contains("NOT_FOUND") => {
                        info!("instance already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.is_not_found() => info!("instance does not exist"),
            Err(e) => return Err(e),
        }

        if InstanceLocation::recorded(machine).is_some() {
            let mut latest = machine.clone();
            let changes = [
                MarkerChange::Clear(Marker::InstanceProject),
                MarkerChange::Clear(Marker::InstanceZone),
                MarkerChange::Clear(Marker::InstanceName),
            ];
            if let Err(e) = persist_machine(self.kube.as_ref(), &mut latest, &changes).await {
                warn!(error = %e, "failed to clear instance markers");
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(machine = %machine.name_any()))]
    async fn update(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let resource = resource_name(machine);
        let desired = Self::desired_location(cluster, machine)?;
        let config = machine_config(machine)?;
        let current = Self::location(cluster, machine)?;

        if current.project != desired.project {
            return Err(Error::unsupported(
                resource,
                "update",
                format!(
                    "moving an instance from project {} to {} is not supported",
                    current.project, desired.project
                ),
            ));
        }
        if current.zone != desired.zone {
            return Err(Error::unsupported(
                resource,
                "update",
                format!(
                    "moving an instance from zone {} to {} is not supported",
                    current.zone, desired.zone
                ),
            ));
        }

        let Some(instance) = cancellable(
            cancel,
            "instances.get",
            self.compute
                .instances_get(&current.project, &current.zone, &current.name),
        )
        .await?
        else {
            info!("instance disappeared, the next pass recreates it");
            return Ok(());
        };

        if instance.machine_type_name() != config.machine_type {
            return Err(Error::unsupported(
                resource,
                "update",
                format!(
                    "changing machine type from {} to {} is not supported",
                    instance.machine_type_name(),
                    config.machine_type
                ),
            ));
        }

        self.record(machine, &current).await
    }

    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool, Error> {
        let location = Self::location(cluster, machine)?;
        Ok(self
            .compute
            .instances_get(&location.project, &location.zone, &location.name)
            .await?
            .is_some())
    }
}
