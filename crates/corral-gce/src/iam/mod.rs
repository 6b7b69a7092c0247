//! Identity operations behind a trait
//!
//! Provisioning logic talks to [`IamClient`]; [`gcloud::GcloudIamClient`] is
//! the production implementation.

pub mod gcloud;

use std::path::Path;

use async_trait::async_trait;

use corral_common::Error;

#[cfg(test)]
use mockall::automock;

/// Service-account and project IAM policy operations
///
/// Implementations resolve "already exists" on create and "not found" on
/// unbind and delete to `Ok(())`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamClient: Send + Sync {
    /// Create a service account `account_id` in `project`
    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<(), Error>;

    /// Grant `roles/<role>` on `project` to the account
    async fn add_role_binding(&self, project: &str, email: &str, role: &str) -> Result<(), Error>;

    /// Revoke `roles/<role>` on `project` from the account
    async fn remove_role_binding(&self, project: &str, email: &str, role: &str) -> Result<(), Error>;

    /// Delete the service account
    async fn delete_service_account(&self, project: &str, email: &str) -> Result<(), Error>;

    /// Create a JSON key for the account and write it to `path`
    async fn create_key(&self, project: &str, email: &str, path: &Path) -> Result<(), Error>;
}

/// Email of a service account
pub fn service_account_email(account_id: &str, project: &str) -> String {
    format!("{account_id}@{project}.iam.gserviceaccount.com")
}
