//! Setup tables: which image and startup script a machine or cluster gets
//!
//! A table is a YAML document:
//!
//! ```yaml
//! items:
//! - params:
//!   - os: ubuntu-1710
//!     roles: [Master]
//!     versions: { kubelet: 1.9.4, controlPlane: 1.9.4 }
//!   image: projects/ubuntu-os-cloud/global/images/family/ubuntu-1710
//!   metadata:
//!     startupScript: |
//!       #!/bin/bash
//! ```
//!
//! A lookup must match exactly one item. Items list every parameter tuple
//! they serve; an item matches when any of its tuples equals the query.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use corral_common::crd::{GceMachineProviderConfig, Machine, MachineRole};
use corral_common::Error;

/// Query parameters of a setup table
pub trait SetupParams: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name used in error messages
    const TABLE: &'static str;

    /// Whether an item entry serves this query
    fn matches(&self, query: &Self) -> bool;
}

/// Parameters selecting a machine's image and startup script
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineParams {
    /// OS key from the machine provider config
    #[serde(default)]
    pub os: String,
    /// Machine roles
    #[serde(default)]
    pub roles: Vec<MachineRole>,
    /// Software versions
    #[serde(default)]
    pub versions: SetupVersions,
}

/// Versions used as lookup keys
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupVersions {
    /// Kubelet version
    #[serde(default)]
    pub kubelet: String,
    /// Control plane version, empty for workers
    #[serde(default)]
    pub control_plane: String,
}

impl MachineParams {
    /// Lookup key for a machine
    pub fn for_machine(machine: &Machine, config: &GceMachineProviderConfig) -> Self {
        Self {
            os: config.os.clone(),
            roles: machine.spec.roles.clone(),
            versions: SetupVersions {
                kubelet: machine.spec.versions.kubelet.clone(),
                control_plane: machine
                    .spec
                    .versions
                    .control_plane
                    .clone()
                    .unwrap_or_default(),
            },
        }
    }

    fn sorted_roles(&self) -> Vec<MachineRole> {
        let mut roles = self.roles.clone();
        roles.sort_by_key(|r| r.to_string());
        roles.dedup();
        roles
    }
}

impl SetupParams for MachineParams {
    const TABLE: &'static str = "machine setup";

    fn matches(&self, query: &Self) -> bool {
        self.os == query.os
            && self.versions == query.versions
            && self.sorted_roles() == query.sorted_roles()
    }
}

/// Parameters selecting cluster-wide setup
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterParams {
    /// GCP project
    #[serde(default)]
    pub project: String,
}

impl SetupParams for ClusterParams {
    const TABLE: &'static str = "cluster setup";

    fn matches(&self, query: &Self) -> bool {
        self == query
    }
}

/// Metadata handed to instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupMetadata {
    /// Script run at first boot
    #[serde(default)]
    pub startup_script: String,
}

/// One table entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(bound(deserialize = "P: DeserializeOwned"))]
pub struct SetupItem<P> {
    /// Parameter tuples this entry serves
    #[serde(default, alias = "machineParams", alias = "clusterParams")]
    pub params: Vec<P>,
    /// Fully qualified image path
    #[serde(default)]
    pub image: String,
    /// Instance metadata
    #[serde(default)]
    pub metadata: SetupMetadata,
}

/// A parsed setup table
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(bound(deserialize = "P: DeserializeOwned"))]
pub struct SetupConfig<P> {
    /// Entries
    #[serde(default = "Vec::new")]
    pub items: Vec<SetupItem<P>>,
}

/// Machine setup table
pub type MachineSetupConfig = SetupConfig<MachineParams>;

/// Cluster setup table
pub type ClusterSetupConfig = SetupConfig<ClusterParams>;

impl<P: SetupParams> SetupConfig<P> {
    /// Parse a table from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration(format!("invalid {} table: {e}", P::TABLE)))
    }

    /// Canonical YAML of the loaded table
    pub fn get_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Image for `params`
    pub fn get_image(&self, params: &P) -> Result<String, Error> {
        Ok(self.lookup(params)?.image.clone())
    }

    /// Metadata for `params`
    pub fn get_metadata(&self, params: &P) -> Result<SetupMetadata, Error> {
        Ok(self.lookup(params)?.metadata.clone())
    }

    /// The single item serving `params`
    pub fn lookup(&self, params: &P) -> Result<&SetupItem<P>, Error> {
        let matching: Vec<_> = self
            .items
            .iter()
            .filter(|item| item.params.iter().any(|p| p.matches(params)))
            .collect();

        match matching.as_slice() {
            [item] => Ok(item),
            [] => Err(Error::SetupNoMatch {
                table: P::TABLE.to_string(),
                params: format!("{params:?}"),
            }),
            many => Err(Error::SetupAmbiguous {
                table: P::TABLE.to_string(),
                params: format!("{params:?}"),
                matches: many.len(),
            }),
        }
    }
}

/// Something that yields the current setup table
#[async_trait]
pub trait SetupSource<P: SetupParams>: Send + Sync {
    /// Current table
    async fn setup_config(&self) -> Result<SetupConfig<P>, Error>;
}

#[async_trait]
impl<P: SetupParams> SetupSource<P> for SetupConfig<P> {
    async fn setup_config(&self) -> Result<SetupConfig<P>, Error> {
        Ok(self.clone())
    }
}

/// Reads the table from a file on every request, so edits apply without a restart
#[derive(Clone, Debug)]
pub struct ConfigWatch<P> {
    path: PathBuf,
    _params: PhantomData<fn() -> P>,
}

impl<P: SetupParams> ConfigWatch<P> {
    /// Watch `path`; fails if it does not exist
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::configuration(format!(
                "{} config {} does not exist",
                P::TABLE,
                path.display()
            )));
        }
        Ok(Self {
            path,
            _params: PhantomData,
        })
    }

    /// Path being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<P: SetupParams> SetupSource<P> for ConfigWatch<P> {
    async fn setup_config(&self) -> Result<SetupConfig<P>, Error> {
        debug!(path = %self.path.display(), table = P::TABLE, "loading setup table");
        let yaml = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::configuration(format!("reading {}: {e}", self.path.display()))
        })?;
        SetupConfig::from_yaml(&yaml)
    }
}
