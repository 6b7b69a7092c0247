//! Building the instance behind a machine
//!
//! The first disk in the provider config boots the instance and is the only
//! one initialized from an image. Sizes are raised to the floor of their disk
//! type (see [`min_disk_size_gb`]); everything else passes through as written.

use std::collections::BTreeMap;

use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use corral_common::crd::{Disk, GceMachineProviderConfig, Machine};
use corral_common::Error;

use crate::compute::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, ComputeService, Instance, Metadata,
    MetadataItem, NetworkInterface, ServiceAccount, Tags,
};
use crate::firewall::{worker_tag, DEFAULT_NETWORK, HTTPS_SERVER_TAG};

/// Solid-state persistent disk type
pub const SSD_DISK_TYPE: &str = "pd-ssd";

/// Smallest solid-state disk that is provisioned
pub const MIN_SSD_DISK_SIZE_GB: i64 = 30;

/// Image used when the setup table names none that can be found
pub const DEFAULT_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-1710";

/// Account the instance runs as when the cluster recorded none
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// OAuth scope granted to the instance service account
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Metadata key of the startup script
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";

static IMAGE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^projects/([^/]+)/global/images/(family/)?([^/]+)$")
        .unwrap_or_else(|e| panic!("image path pattern is invalid: {e}"))
});

/// Parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef<'a> {
    /// Project hosting the image
    pub project: &'a str,
    /// Image name, or family name when `family` is set
    pub name: &'a str,
    /// Whether `name` is a family
    pub family: bool,
}

/// Parse `projects/<project>/global/images/[family/]<name>`
pub fn parse_image(path: &str) -> Option<ImageRef<'_>> {
    let caps = IMAGE_PATH.captures(path)?;
    Some(ImageRef {
        project: caps.get(1)?.as_str(),
        family: caps.get(2).is_some(),
        name: caps.get(3)?.as_str(),
    })
}

/// Confirm `image` exists, falling back to [`DEFAULT_IMAGE`] if it cannot be
/// parsed or the API does not know it
pub async fn resolve_image(compute: &dyn ComputeService, image: &str) -> Result<String, Error> {
    let Some(image_ref) = parse_image(image) else {
        warn!(image, fallback = DEFAULT_IMAGE, "unparsable image path");
        return Ok(DEFAULT_IMAGE.to_string());
    };

    let found = if image_ref.family {
        compute
            .images_get_from_family(image_ref.project, image_ref.name)
            .await?
    } else {
        compute.images_get(image_ref.project, image_ref.name).await?
    };

    match found {
        Some(_) => {
            debug!(image, "image confirmed");
            Ok(image.to_string())
        }
        None => {
            warn!(image, fallback = DEFAULT_IMAGE, "image not found");
            Ok(DEFAULT_IMAGE.to_string())
        }
    }
}

/// Size floor for a disk type, in GB
pub fn min_disk_size_gb(disk_type: &str) -> i64 {
    match disk_type {
        SSD_DISK_TYPE => MIN_SSD_DISK_SIZE_GB,
        _ => 0,
    }
}

/// Disk list for the instance; `boot_image` goes to the first disk only
pub fn build_disks(zone: &str, disks: &[Disk], boot_image: &str) -> Vec<AttachedDisk> {
    disks
        .iter()
        .enumerate()
        .map(|(index, disk)| {
            let boot = index == 0;
            let params = &disk.initialize_params;
            AttachedDisk {
                boot,
                auto_delete: true,
                initialize_params: Some(AttachedDiskInitializeParams {
                    disk_size_gb: params.disk_size_gb.max(min_disk_size_gb(&params.disk_type)),
                    disk_type: format!("zones/{zone}/diskTypes/{}", params.disk_type),
                    source_image: if boot { boot_image.to_string() } else { String::new() },
                }),
            }
        })
        .collect()
}

/// Everything needed to describe the instance for one machine
pub struct InstanceSpec<'a> {
    /// Owning cluster name
    pub cluster_name: &'a str,
    /// The machine
    pub machine: &'a Machine,
    /// Its decoded provider config
    pub config: &'a GceMachineProviderConfig,
    /// Resolved boot image
    pub image: &'a str,
    /// Startup script from the setup table
    pub startup_script: &'a str,
    /// Account email, if the cluster recorded one for the machine's role
    pub service_account: Option<&'a str>,
}

impl InstanceSpec<'_> {
    /// Build the instance insert body
    pub fn build(&self) -> Instance {
        let mut tags = vec![worker_tag(self.cluster_name)];
        if self.machine.spec.is_master() {
            tags.push(HTTPS_SERVER_TAG.to_string());
        }

        Instance {
            name: self.machine.name_any(),
            machine_type: format!(
                "zones/{}/machineTypes/{}",
                self.config.zone, self.config.machine_type
            ),
            can_ip_forward: true,
            disks: build_disks(&self.config.zone, &self.config.disks, self.image),
            network_interfaces: vec![NetworkInterface {
                network: DEFAULT_NETWORK.to_string(),
                access_configs: vec![AccessConfig {
                    type_: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                }],
            }],
            metadata: Some(Metadata {
                items: vec![MetadataItem {
                    key: STARTUP_SCRIPT_KEY.to_string(),
                    value: self.startup_script.to_string(),
                }],
            }),
            tags: Some(Tags { items: tags }),
            labels: BTreeMap::from([("cluster".to_string(), self.cluster_name.to_string())]),
            service_accounts: vec![ServiceAccount {
                email: self
                    .service_account
                    .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
                    .to_string(),
                scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            }],
            status: None,
            self_link: None,
        }
    }
}

/// `gce://<project>/<zone>/<name>`
pub fn provider_id(project: &str, zone: &str, name: &str) -> String {
    format!("gce://{project}/{zone}/{name}")
}
