//! In-memory fakes of the Kubernetes, IAM and compute seams

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};

use corral_cluster::KubeClient;
use corral_common::crd::provider_config::encode;
use corral_common::crd::{
    Cluster, ClusterNetworkingConfig, ClusterSpec, Disk, DiskInitializeParams,
    GceClusterProviderConfig, GceMachineProviderConfig, Machine, MachineRole, MachineSpec,
    MachineVersionInfo, NetworkRanges, CLUSTER_NAME_LABEL,
};
use corral_common::events::EventPublisher;
use corral_common::retry::PollConfig;
use corral_common::Error;

use crate::compute::{ComputeService, Firewall, Image, Instance, Operation, OPERATION_DONE};
use crate::iam::{service_account_email, IamClient};
use crate::setup::MachineSetupConfig;

/// Poll config that finishes quickly in tests
pub fn fast_poll() -> PollConfig {
    PollConfig::new(Duration::from_millis(5), Duration::from_secs(2))
}

/// Cluster in `default` with pod and service ranges and a GCE project
pub fn cluster_fixture(name: &str, project: &str) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            cluster_network: ClusterNetworkingConfig {
                services: NetworkRanges {
                    cidr_blocks: vec!["10.96.0.0/12".to_string()],
                },
                pods: NetworkRanges {
                    cidr_blocks: vec!["192.168.0.0/16".to_string()],
                },
                service_domain: Some("cluster.local".to_string()),
            },
            provider_config: encode(&GceClusterProviderConfig {
                project: project.to_string(),
            })
            .unwrap(),
        },
        status: None,
    }
}

/// Machine of `cluster` in zone us-west5-f
pub fn machine_fixture(name: &str, cluster: &str, role: MachineRole, disks: Vec<Disk>) -> Machine {
    let control_plane = (role == MachineRole::Master).then(|| "1.9.4".to_string());
    Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("1".to_string()),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster.to_string(),
            )])),
            ..Default::default()
        },
        spec: MachineSpec {
            roles: vec![role],
            provider_config: encode(&GceMachineProviderConfig {
                zone: "us-west5-f".to_string(),
                machine_type: "n1-standard-1".to_string(),
                os: "os-name".to_string(),
                disks,
            })
            .unwrap(),
            versions: MachineVersionInfo {
                kubelet: "1.9.4".to_string(),
                control_plane,
                container_runtime: None,
            },
        },
        status: None,
    }
}

/// Disk of the given type and size
pub fn disk(disk_type: &str, size_gb: i64) -> Disk {
    Disk {
        initialize_params: DiskInitializeParams {
            disk_size_gb: size_gb,
            disk_type: disk_type.to_string(),
        },
    }
}

/// Machine setup table serving the fixtures' master and node
pub fn setup_table() -> MachineSetupConfig {
    MachineSetupConfig::from_yaml(
        r#"
items:
- machineParams:
  - os: os-name
    roles: [Master]
    versions: { kubelet: 1.9.4, controlPlane: 1.9.4 }
  image: image-name
  metadata:
    startupScript: "echo master"
- machineParams:
  - os: os-name
    roles: [Node]
    versions: { kubelet: 1.9.4 }
  image: image-name
  metadata:
    startupScript: "echo node"
"#,
    )
    .unwrap()
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::from_kube_write(
        kind,
        name,
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{kind} {name} not found"),
            reason: "NotFound".to_string(),
            code: 404,
        }),
    )
}

fn next_version(counter: &AtomicUsize) -> String {
    (counter.fetch_add(1, Ordering::SeqCst) + 100).to_string()
}

/// Kubernetes API kept in memory, with resourceVersion checks on writes
#[derive(Default)]
pub struct FakeKube {
    clusters: Mutex<BTreeMap<String, Cluster>>,
    machines: Mutex<BTreeMap<String, Machine>>,
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    versions: AtomicUsize,
    cluster_writes: AtomicUsize,
    machine_writes: AtomicUsize,
}

impl FakeKube {
    /// Store a Cluster as-is
    pub fn store_cluster(&self, cluster: Cluster) {
        self.clusters
            .lock()
            .unwrap()
            .insert(cluster.name_any(), cluster);
    }

    /// Write an annotation as another client would, moving the resourceVersion
    pub fn bump_cluster(&self, name: &str, key: &str, value: &str) {
        let version = next_version(&self.versions);
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters.get_mut(name).unwrap();
        cluster
            .annotations_mut()
            .insert(key.to_string(), value.to_string());
        cluster.metadata.resource_version = Some(version);
    }

    /// Stored Cluster
    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.clusters.lock().unwrap().get(name).cloned()
    }

    /// Successful Cluster metadata/spec writes
    pub fn cluster_writes(&self) -> usize {
        self.cluster_writes.load(Ordering::SeqCst)
    }

    /// Store a Machine as-is
    pub fn store_machine(&self, machine: Machine) {
        self.machines
            .lock()
            .unwrap()
            .insert(machine.name_any(), machine);
    }

    /// Stored Machine
    pub fn machine(&self, name: &str) -> Option<Machine> {
        self.machines.lock().unwrap().get(name).cloned()
    }

    /// Successful Machine metadata/spec writes
    pub fn machine_writes(&self) -> usize {
        self.machine_writes.load(Ordering::SeqCst)
    }

    /// Every stored Secret
    pub fn secrets(&self) -> Vec<Secret> {
        self.secrets.lock().unwrap().values().cloned().collect()
    }

    fn write<K, F>(
        &self,
        store: &Mutex<BTreeMap<String, K>>,
        kind: &str,
        incoming: &K,
        merge: F,
    ) -> Result<K, Error>
    where
        K: Resource + Clone,
        F: FnOnce(&K, &K) -> K,
    {
        let name = incoming.name_any();
        let mut objects = store.lock().unwrap();
        let current = objects.get(&name).ok_or_else(|| not_found(kind, &name))?;
        if incoming.resource_version() != current.resource_version() {
            return Err(Error::Conflict {
                kind: kind.to_string(),
                name,
            });
        }
        let mut stored = merge(current, incoming);
        stored.meta_mut().resource_version = Some(next_version(&self.versions));
        objects.insert(name, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.cluster(name))
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, Error> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_machine(&self, _namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        Ok(self.machine(name))
    }

    async fn list_cluster_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.namespace().as_deref() == Some(namespace))
            .filter(|m| m.labels().get(CLUSTER_NAME_LABEL).map(String::as_str) == Some(cluster_name))
            .cloned()
            .collect())
    }

    async fn replace_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let stored = self.write(&self.clusters, "Cluster", cluster, |current, incoming| Cluster {
            status: current.status.clone(),
            ..incoming.clone()
        })?;
        self.cluster_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        self.write(&self.clusters, "Cluster", cluster, |current, incoming| Cluster {
            status: incoming.status.clone(),
            ..current.clone()
        })
    }

    async fn replace_machine(&self, machine: &Machine) -> Result<Machine, Error> {
        let stored = self.write(&self.machines, "Machine", machine, |current, incoming| Machine {
            status: current.status.clone(),
            ..incoming.clone()
        })?;
        self.machine_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace_machine_status(&self, machine: &Machine) -> Result<Machine, Error> {
        self.write(&self.machines, "Machine", machine, |current, incoming| Machine {
            status: incoming.status.clone(),
            ..current.clone()
        })
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.secrets.lock().unwrap().insert(key, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// IAM kept in memory
#[derive(Default)]
pub struct FakeIam {
    accounts: Mutex<BTreeSet<String>>,
    bindings: Mutex<Vec<(String, String)>>,
    key_paths: Mutex<Vec<PathBuf>>,
}

impl FakeIam {
    /// Emails of existing accounts
    pub fn accounts(&self) -> Vec<String> {
        self.accounts.lock().unwrap().iter().cloned().collect()
    }

    /// Roles bound to `email`
    pub fn bindings_for(&self, email: &str) -> Vec<String> {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|(member, _)| member == email)
            .map(|(_, role)| role.clone())
            .collect()
    }

    /// Paths keys were written to
    pub fn key_paths(&self) -> Vec<PathBuf> {
        self.key_paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl IamClient for FakeIam {
    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        _display_name: &str,
    ) -> Result<(), Error> {
        self.accounts
            .lock()
            .unwrap()
            .insert(service_account_email(account_id, project));
        Ok(())
    }

    async fn add_role_binding(&self, _project: &str, email: &str, role: &str) -> Result<(), Error> {
        self.bindings
            .lock()
            .unwrap()
            .push((email.to_string(), role.to_string()));
        Ok(())
    }

    async fn remove_role_binding(&self, _project: &str, email: &str, role: &str) -> Result<(), Error> {
        self.bindings
            .lock()
            .unwrap()
            .retain(|(member, bound)| !(member == email && bound == role));
        Ok(())
    }

    async fn delete_service_account(&self, _project: &str, email: &str) -> Result<(), Error> {
        self.accounts.lock().unwrap().remove(email);
        Ok(())
    }

    async fn create_key(&self, _project: &str, email: &str, path: &Path) -> Result<(), Error> {
        let key = serde_json::json!({ "type": "service_account", "client_email": email });
        tokio::fs::write(path, key.to_string())
            .await
            .map_err(|e| Error::internal(e.to_string()))?;
        self.key_paths.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Compute API kept in memory; every operation completes immediately
#[derive(Default)]
pub struct FakeCompute {
    firewalls: Mutex<BTreeMap<String, Firewall>>,
    instances: Mutex<BTreeMap<(String, String), Instance>>,
    images: Mutex<Vec<Image>>,
    operations: AtomicUsize,
    firewall_list_calls: AtomicUsize,
    firewall_inserts: AtomicUsize,
    instance_inserts: AtomicUsize,
}

impl FakeCompute {
    /// Pretend a rule already exists
    pub fn add_firewall(&self, rule: Firewall) {
        self.firewalls.lock().unwrap().insert(rule.name.clone(), rule);
    }

    /// Names of existing rules
    pub fn firewall_names(&self) -> Vec<String> {
        self.firewalls.lock().unwrap().keys().cloned().collect()
    }

    /// Calls to `firewalls_get`
    pub fn firewall_list_calls(&self) -> usize {
        self.firewall_list_calls.load(Ordering::SeqCst)
    }

    /// Successful rule inserts
    pub fn firewall_inserts(&self) -> usize {
        self.firewall_inserts.load(Ordering::SeqCst)
    }

    /// Successful instance inserts
    pub fn instance_inserts(&self) -> usize {
        self.instance_inserts.load(Ordering::SeqCst)
    }

    /// Existing instance
    pub fn instance(&self, zone: &str, name: &str) -> Option<Instance> {
        self.instances
            .lock()
            .unwrap()
            .get(&(zone.to_string(), name.to_string()))
            .cloned()
    }

    /// Pretend an instance already exists
    pub fn add_instance(&self, zone: &str, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert((zone.to_string(), instance.name.clone()), instance);
    }

    /// Make an image known under `projects/<project>/global/images/<name>`
    pub fn add_image(&self, project: &str, name: &str, family: Option<&str>) {
        self.images.lock().unwrap().push(Image {
            name: name.to_string(),
            family: family.map(str::to_string),
            self_link: format!("projects/{project}/global/images/{name}"),
        });
    }

    fn done(&self, zone: Option<&str>) -> Operation {
        let id = self.operations.fetch_add(1, Ordering::SeqCst);
        Operation {
            name: format!("operation-{id}"),
            status: OPERATION_DONE.to_string(),
            zone: zone.map(|z| format!("https://www.googleapis.com/compute/v1/projects/p/zones/{z}")),
            ..Default::default()
        }
    }

    fn image_in(&self, project: &str, matches: impl Fn(&Image) -> bool) -> Option<Image> {
        let prefix = format!("projects/{project}/");
        self.images
            .lock()
            .unwrap()
            .iter()
            .find(|image| image.self_link.starts_with(&prefix) && matches(image))
            .cloned()
    }
}

#[async_trait]
impl ComputeService for FakeCompute {
    async fn firewalls_get(&self, _project: &str) -> Result<Vec<Firewall>, Error> {
        self.firewall_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.firewalls.lock().unwrap().values().cloned().collect())
    }

    async fn firewalls_insert(&self, _project: &str, rule: &Firewall) -> Result<Operation, Error> {
        let mut firewalls = self.firewalls.lock().unwrap();
        if firewalls.contains_key(&rule.name) {
            return Err(Error::compute_status(
                format!("firewalls/{}", rule.name),
                409,
                "alreadyExists",
            ));
        }
        firewalls.insert(rule.name.clone(), rule.clone());
        self.firewall_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(self.done(None))
    }

    async fn firewalls_delete(&self, _project: &str, name: &str) -> Result<Operation, Error> {
        match self.firewalls.lock().unwrap().remove(name) {
            Some(_) => Ok(self.done(None)),
            None => Err(Error::compute_not_found(format!("firewalls/{name}"))),
        }
    }

    async fn global_operations_get(&self, _project: &str, operation: &str) -> Result<Operation, Error> {
        Ok(Operation {
            name: operation.to_string(),
            status: OPERATION_DONE.to_string(),
            ..Default::default()
        })
    }

    async fn images_get(&self, project: &str, image: &str) -> Result<Option<Image>, Error> {
        Ok(self.image_in(project, |i| i.name == image))
    }

    async fn images_get_from_family(&self, project: &str, family: &str) -> Result<Option<Image>, Error> {
        Ok(self.image_in(project, |i| i.family.as_deref() == Some(family)))
    }

    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation, Error> {
        let key = (zone.to_string(), instance.name.clone());
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&key) {
            return Err(Error::compute_status(
                format!("instances/{}", instance.name),
                409,
                "alreadyExists",
            ));
        }
        let stored = Instance {
            status: Some("RUNNING".to_string()),
            self_link: Some(format!(
                "https://www.googleapis.com/compute/v1/projects/{project}/zones/{zone}/instances/{}",
                instance.name
            )),
            ..instance.clone()
        };
        instances.insert(key, stored);
        self.instance_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(self.done(Some(zone)))
    }

    async fn instances_delete(&self, _project: &str, zone: &str, name: &str) -> Result<Operation, Error> {
        match self
            .instances
            .lock()
            .unwrap()
            .remove(&(zone.to_string(), name.to_string()))
        {
            Some(_) => Ok(self.done(Some(zone))),
            None => Err(Error::compute_not_found(format!("instances/{name}"))),
        }
    }

    async fn instances_get(&self, _project: &str, zone: &str, name: &str) -> Result<Option<Instance>, Error> {
        Ok(self.instance(zone, name))
    }

    async fn zone_operations_get(
        &self,
        _project: &str,
        _zone: &str,
        operation: &str,
    ) -> Result<Operation, Error> {
        Ok(Operation {
            name: operation.to_string(),
            status: OPERATION_DONE.to_string(),
            ..Default::default()
        })
    }
}

/// Event publisher remembering (type, reason) pairs
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingEvents {
    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((format!("{type_:?}"), reason.to_string()));
    }
}
