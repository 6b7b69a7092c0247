//! GCE actuators for corral
//!
//! [`GceClusterActuator`] provisions the per-cluster service accounts and
//! firewall rules; [`GceMachineActuator`] creates one compute instance per
//! Machine. Both talk to GCP through the [`compute::ComputeService`] and
//! [`iam::IamClient`] seams.

#![deny(missing_docs)]

pub mod cluster_actuator;
pub mod compute;
pub mod firewall;
pub mod iam;
pub mod instance;
pub mod machine_actuator;
pub mod records;
pub mod service_account;
pub mod setup;

#[cfg(test)]
mod testing;

pub use cluster_actuator::GceClusterActuator;
pub use machine_actuator::GceMachineActuator;
