//! `gcloud` shell-out implementation of [`IamClient`]

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use corral_common::Error;

use super::IamClient;

/// Default per-command timeout
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const ALREADY_EXISTS: &[&str] = &["already exists", "ALREADY_EXISTS"];
const NOT_FOUND: &[&str] = &["NOT_FOUND", "not found", "does not exist", "is not a member"];

/// Runs `gcloud` with a timeout and returns combined output on failure
#[derive(Clone, Debug)]
pub struct GcloudIamClient {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for GcloudIamClient {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("gcloud"),
            timeout: COMMAND_TIMEOUT,
        }
    }
}

/// How a failed command maps onto the trait contract
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tolerate {
    Nothing,
    AlreadyExists,
    NotFound,
}

impl Tolerate {
    fn matches(self, output: &str) -> bool {
        let needles = match self {
            Tolerate::Nothing => return false,
            Tolerate::AlreadyExists => ALREADY_EXISTS,
            Tolerate::NotFound => NOT_FOUND,
        };
        needles.iter().any(|n| output.contains(n))
    }
}

impl GcloudIamClient {
    /// Use a specific binary and timeout
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[String], tolerate: Tolerate) -> Result<(), Error> {
        let command_line = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command_line, "running");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::command(
                    &command_line,
                    format!("timed out after {:?}", self.timeout),
                    "",
                )
            })?
            .map_err(|e| Error::command(&command_line, format!("failed to execute: {e}"), ""))?;

        if output.status.success() {
            return Ok(());
        }

        let combined = combined_output(&output.stdout, &output.stderr);
        if tolerate.matches(&combined) {
            info!(command = %command_line, ?tolerate, "treating failure as success");
            return Ok(());
        }

        warn!(command = %command_line, status = %output.status, "command failed");
        Err(Error::command(
            command_line,
            format!("exited with {}", output.status),
            combined,
        ))
    }
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined.trim().to_string()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl IamClient for GcloudIamClient {
    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<(), Error> {
        let display = format!("--display-name={display_name}");
        self.run(
            &args(&[
                "--project",
                project,
                "iam",
                "service-accounts",
                "create",
                &display,
                account_id,
            ]),
            Tolerate::AlreadyExists,
        )
        .await
    }

    async fn add_role_binding(&self, project: &str, email: &str, role: &str) -> Result<(), Error> {
        let member = format!("--member=serviceAccount:{email}");
        let role = format!("--role=roles/{role}");
        self.run(
            &args(&["projects", "add-iam-policy-binding", project, &member, &role]),
            Tolerate::Nothing,
        )
        .await
    }

    async fn remove_role_binding(&self, project: &str, email: &str, role: &str) -> Result<(), Error> {
        let member = format!("--member=serviceAccount:{email}");
        let role = format!("--role=roles/{role}");
        self.run(
            &args(&["projects", "remove-iam-policy-binding", project, &member, &role]),
            Tolerate::NotFound,
        )
        .await
    }

    async fn delete_service_account(&self, project: &str, email: &str) -> Result<(), Error> {
        self.run(
            &args(&[
                "--project",
                project,
                "iam",
                "service-accounts",
                "delete",
                email,
                "--quiet",
            ]),
            Tolerate::NotFound,
        )
        .await
    }

    async fn create_key(&self, project: &str, email: &str, path: &Path) -> Result<(), Error> {
        let path = path.to_string_lossy();
        self.run(
            &args(&[
                "--project",
                project,
                "iam",
                "service-accounts",
                "keys",
                "create",
                &path,
                "--iam-account",
                email,
            ]),
            Tolerate::Nothing,
        )
        .await
    }
}
