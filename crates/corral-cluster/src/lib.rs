//! Cluster and Machine reconciliation for corral
//!
//! This crate owns the provider-neutral half of the system: the reconcile
//! loops, the resource client, and the actuator contract a cloud provider
//! implements. `corral-gce` supplies the GCE actuators.

pub mod actuator;
pub mod client;
pub mod controller;

pub use actuator::{ClusterActuator, MachineActuator};
pub use client::{KubeClient, KubeClientImpl};
pub use controller::{error_policy, Context};

pub use corral_common::{Error, Result};
