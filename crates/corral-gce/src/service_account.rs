//! Service-account provisioning for cluster roles
//!
//! Each role prefix gets at most one account per cluster. The account email
//! is recorded under [`Marker::ServiceAccount`] once every role binding is in
//! place; that marker is the only durable record of which account was made.
//!
//! Creation is at-least-once: if a binding fails, the account and the bindings
//! already granted stay behind, and the next pass creates a fresh account.
//! Account ids carry 5 random characters from a 36-symbol alphabet, about
//! 60 million ids per prefix, so collisions within a project are negligible.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_cluster::KubeClient;
use corral_common::crd::{Cluster, Machine};
use corral_common::markers::{self, Marker};
use corral_common::retry::cancellable;
use corral_common::{Error, KUBE_SYSTEM_NAMESPACE};

use crate::iam::{service_account_email, IamClient};
use crate::records::{persist_cluster, MarkerChange};

/// Prefix of the control-plane node account
pub const MASTER_PREFIX: &str = "k8s-master";
/// Prefix of the worker node account
pub const WORKER_PREFIX: &str = "k8s-worker";
/// Prefix of the ingress controller account
pub const INGRESS_CONTROLLER_PREFIX: &str = "k8s-ingress-controller";
/// Prefix of the machine controller account
pub const MACHINE_CONTROLLER_PREFIX: &str = "k8s-machine-controller";

/// Secret holding the ingress controller key
pub const INGRESS_CONTROLLER_SECRET: &str = "glbc-gcp-key";
/// Secret holding the machine controller key
pub const MACHINE_CONTROLLER_SECRET: &str = "machine-controller-credential";
/// Data key of credential secrets
pub const SECRET_DATA_KEY: &str = "service-account.json";

const ID_SUFFIX_LEN: usize = 5;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Where a role's key is imported
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretTarget {
    /// Secret name
    pub name: &'static str,
    /// Secret namespace
    pub namespace: &'static str,
}

/// One logical account: its prefix, project roles, and optional key secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRole {
    /// Account id prefix and marker key
    pub prefix: &'static str,
    /// Project roles, without the `roles/` prefix
    pub roles: &'static [&'static str],
    /// Secret the account key is imported into, for controller accounts
    pub secret: Option<SecretTarget>,
}

/// The accounts a cluster can own, fixed at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleTable {
    /// Control-plane nodes
    pub master: AccountRole,
    /// Worker nodes
    pub worker: AccountRole,
    /// Ingress controller
    pub ingress_controller: AccountRole,
    /// Machine controller
    pub machine_controller: AccountRole,
}

impl Default for RoleTable {
    fn default() -> Self {
        Self {
            master: AccountRole {
                prefix: MASTER_PREFIX,
                roles: &[
                    "compute.instanceAdmin",
                    "compute.networkAdmin",
                    "compute.securityAdmin",
                    "compute.viewer",
                    "iam.serviceAccountUser",
                    "storage.admin",
                    "storage.objectViewer",
                ],
                secret: None,
            },
            worker: AccountRole {
                prefix: WORKER_PREFIX,
                roles: &[],
                secret: None,
            },
            ingress_controller: AccountRole {
                prefix: INGRESS_CONTROLLER_PREFIX,
                roles: &[
                    "compute.instanceAdmin.v1",
                    "compute.networkAdmin",
                    "compute.securityAdmin",
                    "iam.serviceAccountActor",
                ],
                secret: Some(SecretTarget {
                    name: INGRESS_CONTROLLER_SECRET,
                    namespace: KUBE_SYSTEM_NAMESPACE,
                }),
            },
            machine_controller: AccountRole {
                prefix: MACHINE_CONTROLLER_PREFIX,
                roles: &["compute.instanceAdmin.v1", "iam.serviceAccountActor"],
                secret: Some(SecretTarget {
                    name: MACHINE_CONTROLLER_SECRET,
                    namespace: "default",
                }),
            },
        }
    }
}

impl RoleTable {
    /// Node accounts, created for every cluster
    pub fn node_accounts(&self) -> [&AccountRole; 2] {
        [&self.master, &self.worker]
    }

    /// Controller accounts, created only when credential provisioning is on
    pub fn controller_accounts(&self) -> [&AccountRole; 2] {
        [&self.ingress_controller, &self.machine_controller]
    }

    /// Every account, in teardown order
    pub fn all(&self) -> [&AccountRole; 4] {
        [
            &self.master,
            &self.worker,
            &self.ingress_controller,
            &self.machine_controller,
        ]
    }
}

/// `<prefix>-<5 random lowercase alphanumerics>`
pub fn generate_account_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}-{suffix}")
}

/// Email of the account a machine's instance should run as
pub fn default_service_account_for_machine<'c>(
    table: &RoleTable,
    cluster: &'c Cluster,
    machine: &Machine,
) -> Option<&'c str> {
    let role = if machine.spec.is_master() {
        &table.master
    } else {
        &table.worker
    };
    markers::get(cluster, Marker::ServiceAccount(role.prefix))
}

/// Creates and deletes cluster service accounts through [`IamClient`]
pub struct ServiceAccountProvisioner {
    iam: Arc<dyn IamClient>,
    kube: Arc<dyn KubeClient>,
}

impl ServiceAccountProvisioner {
    /// Build a provisioner
    pub fn new(iam: Arc<dyn IamClient>, kube: Arc<dyn KubeClient>) -> Self {
        Self { iam, kube }
    }

    /// Make sure the account for `role` exists; returns its email when this
    /// call created it and `None` when the marker was already there.
    #[instrument(skip(self, cluster, role, cancel), fields(cluster = %cluster.name_any(), prefix = role.prefix))]
    pub async fn ensure(
        &self,
        cluster: &mut Cluster,
        project: &str,
        role: &AccountRole,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Error> {
        if markers::get(cluster, Marker::ServiceAccount(role.prefix)).is_some() {
            return Ok(None);
        }

        let account_id = generate_account_id(role.prefix);
        let display_name = format!("{} service account", role.prefix);
        cancellable(
            cancel,
            "iam.service-accounts.create",
            self.iam.create_service_account(project, &account_id, &display_name),
        )
        .await?;

        let email = service_account_email(&account_id, project);
        for binding in role.roles {
            cancellable(
                cancel,
                "iam.add-policy-binding",
                self.iam.add_role_binding(project, &email, binding),
            )
            .await
            .map_err(|e| {
                warn!(%email, role = binding, error = %e, "granting role failed");
                e
            })?;
        }

        persist_cluster(
            self.kube.as_ref(),
            cluster,
            &[MarkerChange::Set(Marker::ServiceAccount(role.prefix), email.clone())],
        )
        .await?;
        info!(%email, "service account created");
        Ok(Some(email))
    }

    /// Import a fresh key for `role` into its secret unless that already
    /// happened; returns whether a key was imported.
    ///
    /// The key file lives in a temporary directory that is removed on every
    /// path, including failures.
    #[instrument(skip(self, cluster, role, cancel), fields(cluster = %cluster.name_any(), prefix = role.prefix))]
    pub async fn import_credentials(
        &self,
        cluster: &mut Cluster,
        project: &str,
        role: &AccountRole,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let Some(target) = &role.secret else {
            return Ok(false);
        };
        if markers::is_present(cluster, Marker::Credentials(role.prefix)) {
            return Ok(false);
        }
        let email = markers::get(cluster, Marker::ServiceAccount(role.prefix))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "service-account",
                    format!("no {} account to create a key for", role.prefix),
                )
            })?
            .to_string();

        let dir = tempfile::tempdir()
            .map_err(|e| Error::internal_with_context("service-account", format!("tempdir: {e}")))?;
        let key_path = dir.path().join(format!("{}-key.json", role.prefix));
        cancellable(cancel, "iam.keys.create", self.iam.create_key(project, &email, &key_path)).await?;
        let key = tokio::fs::read(&key_path).await.map_err(|e| {
            Error::internal_with_context("service-account", format!("reading key file: {e}"))
        })?;

        self.kube.apply_secret(&credential_secret(target, key)).await?;
        drop(dir);

        persist_cluster(
            self.kube.as_ref(),
            cluster,
            &[MarkerChange::Set(
                Marker::Credentials(role.prefix),
                markers::PRESENT.to_string(),
            )],
        )
        .await?;
        info!(secret = target.name, namespace = target.namespace, "credentials imported");
        Ok(true)
    }

    /// Remove the account for `role` and everything granted to it.
    ///
    /// A missing marker means there is nothing to delete. Every unbind is
    /// attempted; failures are collected and the account is still deleted.
    #[instrument(skip(self, cluster, role, cancel), fields(cluster = %cluster.name_any(), prefix = role.prefix))]
    pub async fn delete(
        &self,
        cluster: &mut Cluster,
        project: &str,
        role: &AccountRole,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let Some(email) = markers::get(cluster, Marker::ServiceAccount(role.prefix)).map(str::to_string)
        else {
            info!("no service account recorded, nothing to delete");
            return Ok(());
        };

        let mut failures = Vec::new();
        for binding in role.roles {
            let unbind = self.iam.remove_role_binding(project, &email, binding);
            if let Err(e) = cancellable(cancel, "iam.remove-policy-binding", unbind).await {
                if matches!(e, Error::Cancelled { .. }) {
                    return Err(e);
                }
                warn!(%email, role = binding, error = %e, "revoking role failed");
                failures.push(e);
            }
        }
        let remove = self.iam.delete_service_account(project, &email);
        if let Err(e) = cancellable(cancel, "iam.service-accounts.delete", remove).await {
            if matches!(e, Error::Cancelled { .. }) {
                return Err(e);
            }
            failures.push(e);
        }
        if let Some(target) = &role.secret {
            if let Err(e) = self.kube.delete_secret(target.namespace, target.name).await {
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            return Err(Error::partial_failure(
                format!("delete service account {email}"),
                failures,
            ));
        }

        persist_cluster(
            self.kube.as_ref(),
            cluster,
            &[
                MarkerChange::Clear(Marker::ServiceAccount(role.prefix)),
                MarkerChange::Clear(Marker::Credentials(role.prefix)),
            ],
        )
        .await?;
        info!(%email, "service account deleted");
        Ok(())
    }
}

fn credential_secret(target: &SecretTarget, key: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(target.name.to_string()),
            namespace: Some(target.namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "corral".to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(SECRET_DATA_KEY.to_string(), ByteString(key))])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::MockIamClient;
    use crate::testing::{cluster_fixture, machine_fixture, FakeIam, FakeKube};
    use corral_common::crd::MachineRole;

    fn provisioner(iam: Arc<dyn IamClient>, kube: Arc<FakeKube>) -> ServiceAccountProvisioner {
        ServiceAccountProvisioner::new(iam, kube)
    }

    #[test]
    fn account_ids_have_a_short_lowercase_suffix() {
        let id = generate_account_id(MASTER_PREFIX);
        let suffix = id.strip_prefix("k8s-master-").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.bytes().all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn role_table_matches_the_known_accounts() {
        let table = RoleTable::default();
        assert_eq!(table.master.roles.len(), 7);
        assert!(table.worker.roles.is_empty());
        assert_eq!(
            table.ingress_controller.secret.as_ref().unwrap().namespace,
            "kube-system"
        );
        assert_eq!(
            table.machine_controller.secret.as_ref().unwrap().name,
            "machine-controller-credential"
        );
        assert_eq!(table.all().len(), 4);
    }

    #[tokio::test]
    async fn ensure_creates_binds_and_records_once() {
        let iam = Arc::new(FakeIam::default());
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "project-name-2000");
        kube.store_cluster(cluster.clone());
        let accounts = provisioner(iam.clone(), kube.clone());
        let table = RoleTable::default();

        let email = accounts
            .ensure(&mut cluster, "project-name-2000", &table.master, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(email.starts_with("k8s-master-"));
        assert!(email.ends_with("@project-name-2000.iam.gserviceaccount.com"));
        assert_eq!(iam.accounts().len(), 1);
        assert_eq!(iam.bindings_for(&email).len(), 7);

        let again = accounts
            .ensure(&mut cluster, "project-name-2000", &table.master, &CancellationToken::new())
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(iam.accounts().len(), 1);

        let stored = kube.cluster("cluster-test").unwrap();
        assert_eq!(
            markers::get(&stored, Marker::ServiceAccount(MASTER_PREFIX)),
            Some(email.as_str())
        );
    }

    #[tokio::test]
    async fn failed_binding_stops_and_records_nothing() {
        let mut iam = MockIamClient::new();
        iam.expect_create_service_account().returning(|_, _, _| Ok(()));
        iam.expect_add_role_binding()
            .times(1)
            .returning(|_, _, _| Err(Error::command("gcloud projects add-iam-policy-binding", "exited with 1", "PERMISSION_DENIED")));
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "p");
        kube.store_cluster(cluster.clone());
        let accounts = provisioner(Arc::new(iam), kube.clone());

        let err = accounts
            .ensure(&mut cluster, "p", &RoleTable::default().master, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PERMISSION_DENIED"));
        assert_eq!(kube.cluster_writes(), 0);
    }

    #[tokio::test]
    async fn delete_without_marker_is_a_no_op() {
        let iam = MockIamClient::new();
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "p");
        let accounts = provisioner(Arc::new(iam), kube.clone());

        accounts
            .delete(&mut cluster, "p", &RoleTable::default().master, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(kube.cluster_writes(), 0);
    }

    #[tokio::test]
    async fn delete_aggregates_unbind_failures_and_still_deletes_the_account() {
        let mut iam = MockIamClient::new();
        iam.expect_remove_role_binding().returning(|_, _, role| {
            if role.starts_with("storage") {
                Err(Error::command("gcloud", "exited with 1", format!("cannot revoke {role}")))
            } else {
                Ok(())
            }
        });
        iam.expect_delete_service_account().times(1).returning(|_, _| Ok(()));
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "p");
        markers::set(&mut cluster, Marker::ServiceAccount(MASTER_PREFIX), "m@p.iam.gserviceaccount.com");
        kube.store_cluster(cluster.clone());
        let accounts = provisioner(Arc::new(iam), kube.clone());

        let err = accounts
            .delete(&mut cluster, "p", &RoleTable::default().master, &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            Error::PartialFailure { failures, .. } => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].contains("storage.admin"));
                assert!(failures[1].contains("storage.objectViewer"));
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert!(err.is_retryable());
        // The record survives so the next pass retries the teardown
        let stored = kube.cluster("cluster-test").unwrap();
        assert!(markers::get(&stored, Marker::ServiceAccount(MASTER_PREFIX)).is_some());
    }

    #[tokio::test]
    async fn credentials_land_in_the_secret_and_the_key_file_is_removed() {
        let iam = Arc::new(FakeIam::default());
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "p");
        kube.store_cluster(cluster.clone());
        let accounts = provisioner(iam.clone(), kube.clone());
        let role = RoleTable::default().machine_controller;

        let cancel = CancellationToken::new();

        accounts.ensure(&mut cluster, "p", &role, &cancel).await.unwrap();
        assert!(accounts.import_credentials(&mut cluster, "p", &role, &cancel).await.unwrap());
        assert!(!accounts.import_credentials(&mut cluster, "p", &role, &cancel).await.unwrap());

        let secrets = kube.secrets();
        assert_eq!(secrets.len(), 1);
        let secret = &secrets[0];
        assert_eq!(secret.name_any(), MACHINE_CONTROLLER_SECRET);
        assert_eq!(secret.namespace().as_deref(), Some("default"));
        let data = secret.data.as_ref().unwrap();
        assert!(!data[SECRET_DATA_KEY].0.is_empty());

        let key_paths = iam.key_paths();
        assert_eq!(key_paths.len(), 1);
        assert!(!key_paths[0].exists());
    }

    #[tokio::test]
    async fn cancelled_reconcile_stops_before_touching_iam() {
        let iam = Arc::new(FakeIam::default());
        let kube = Arc::new(FakeKube::default());
        let mut cluster = cluster_fixture("cluster-test", "p");
        kube.store_cluster(cluster.clone());
        let accounts = provisioner(iam.clone(), kube.clone());
        let role = RoleTable::default().master;
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let err = accounts.ensure(&mut cluster, "p", &role, &cancelled).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(iam.accounts().is_empty());

        let email = accounts
            .ensure(&mut cluster, "p", &role, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let err = accounts.delete(&mut cluster, "p", &role, &cancelled).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(iam.accounts().len(), 1);
        assert_eq!(iam.bindings_for(&email).len(), 7);
        assert!(markers::get(&kube.cluster("cluster-test").unwrap(), Marker::ServiceAccount(MASTER_PREFIX)).is_some());
    }

    #[test]
    fn machines_run_as_their_role_account() {
        let table = RoleTable::default();
        let mut cluster = cluster_fixture("cluster-test", "p");
        markers::set(&mut cluster, Marker::ServiceAccount(MASTER_PREFIX), "m@p.iam.gserviceaccount.com");
        markers::set(&mut cluster, Marker::ServiceAccount(WORKER_PREFIX), "w@p.iam.gserviceaccount.com");

        let master = machine_fixture("m", "cluster-test", MachineRole::Master, Vec::new());
        let node = machine_fixture("n", "cluster-test", MachineRole::Node, Vec::new());
        assert_eq!(
            default_service_account_for_machine(&table, &cluster, &master),
            Some("m@p.iam.gserviceaccount.com")
        );
        assert_eq!(
            default_service_account_for_machine(&table, &cluster, &node),
            Some("w@p.iam.gserviceaccount.com")
        );
    }
}
