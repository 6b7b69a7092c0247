//! Compute v1 REST client
//!
//! Authenticates with application default credentials through `gcp_auth` and
//! retries retryable failures (transport errors, 429, 5xx) with backoff before
//! handing them to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use corral_common::retry::{retry_with_backoff, RetryConfig};
use corral_common::Error;

use super::{ComputeService, Firewall, Image, Instance, Operation};

/// Production API endpoint
pub const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// OAuth scope for compute calls
pub const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by Google APIs
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct FirewallList {
    #[serde(default)]
    items: Vec<Firewall>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// REST implementation of [`ComputeService`]
pub struct GceComputeClient {
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for GceComputeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GceComputeClient")
            .field("base_url", &self.base_url)
            .field("token_provider", &"<TokenProvider>")
            .finish()
    }
}

impl GceComputeClient {
    /// Build a client from application default credentials
    pub async fn new() -> Result<Self, Error> {
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::configuration(format!("failed to initialize GCP auth: {e}")))?;
        Self::with_provider(token_provider, DEFAULT_BASE_URL)
    }

    /// Build a client with an explicit token provider and endpoint
    pub fn with_provider(
        token_provider: Arc<dyn TokenProvider>,
        base_url: impl Into<String>,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            token_provider,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::with_max_attempts(5),
        })
    }

    async fn access_token(&self) -> Result<String, Error> {
        let token = self
            .token_provider
            .token(&[COMPUTE_SCOPE])
            .await
            .map_err(|e| Error::compute_transport("oauth", format!("failed to get access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// One request with retries; `path` doubles as the resource name in errors
    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, Error>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let name = format!("{method} {path}");
        retry_with_backoff(&self.retry, &name, || {
            let method = method.clone();
            async move { self.call_once(method, path, body).await }
        })
        .await
    }

    async fn call_once<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, Error>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let token = self.access_token().await?;
        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::compute_transport(path, e.to_string()))?;
        let status = response.status();
        debug!(path, status = status.as_u16(), "compute response");

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::compute_transport(path, format!("invalid response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_from_response(path, status, &text))
    }

    /// `call` with 404 mapped to `None`
    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        match self.call::<(), T>(Method::GET, path, None).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn error_from_response(resource: &str, status: StatusCode, body: &str) -> Error {
    let (code, message) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) if parsed.error.code != 0 => (parsed.error.code, parsed.error.message),
        Ok(parsed) => (status.as_u16(), parsed.error.message),
        Err(_) => (status.as_u16(), format!("{status}: {body}")),
    };
    Error::compute_status(resource, code, message)
}

#[async_trait]
impl ComputeService for GceComputeClient {
    #[instrument(skip(self))]
    async fn firewalls_get(&self, project: &str) -> Result<Vec<Firewall>, Error> {
        let mut rules = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let path = match &page_token {
                Some(token) => format!("projects/{project}/global/firewalls?pageToken={token}"),
                None => format!("projects/{project}/global/firewalls"),
            };
            let page: FirewallList = self.call::<(), _>(Method::GET, &path, None).await?;
            rules.extend(page.items);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(rules),
            }
        }
    }

    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    async fn firewalls_insert(&self, project: &str, rule: &Firewall) -> Result<Operation, Error> {
        let path = format!("projects/{project}/global/firewalls");
        self.call(Method::POST, &path, Some(rule)).await
    }

    #[instrument(skip(self))]
    async fn firewalls_delete(&self, project: &str, name: &str) -> Result<Operation, Error> {
        let path = format!("projects/{project}/global/firewalls/{name}");
        self.call::<(), _>(Method::DELETE, &path, None).await
    }

    async fn global_operations_get(&self, project: &str, operation: &str) -> Result<Operation, Error> {
        let path = format!("projects/{project}/global/operations/{operation}");
        self.call::<(), _>(Method::GET, &path, None).await
    }

    #[instrument(skip(self))]
    async fn images_get(&self, project: &str, image: &str) -> Result<Option<Image>, Error> {
        self.get_opt(&format!("projects/{project}/global/images/{image}"))
            .await
    }

    #[instrument(skip(self))]
    async fn images_get_from_family(&self, project: &str, family: &str) -> Result<Option<Image>, Error> {
        self.get_opt(&format!("projects/{project}/global/images/family/{family}"))
            .await
    }

    #[instrument(skip(self, instance), fields(instance = %instance.name))]
    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation, Error> {
        let path = format!("projects/{project}/zones/{zone}/instances");
        self.call(Method::POST, &path, Some(instance)).await
    }

    #[instrument(skip(self))]
    async fn instances_delete(&self, project: &str, zone: &str, name: &str) -> Result<Operation, Error> {
        let path = format!("projects/{project}/zones/{zone}/instances/{name}");
        self.call::<(), _>(Method::DELETE, &path, None).await
    }

    #[instrument(skip(self))]
    async fn instances_get(&self, project: &str, zone: &str, name: &str) -> Result<Option<Instance>, Error> {
        self.get_opt(&format!("projects/{project}/zones/{zone}/instances/{name}"))
            .await
    }

    async fn zone_operations_get(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation, Error> {
        let path = format!("projects/{project}/zones/{zone}/operations/{operation}");
        self.call::<(), _>(Method::GET, &path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_bodies_keep_the_api_message() {
        let body = r#"{"error":{"code":404,"message":"The resource 'projects/p/global/firewalls/x' was not found","errors":[]}}"#;
        let err = error_from_response("projects/p/global/firewalls/x", StatusCode::NOT_FOUND, body);
        assert!(err.is_not_found());
        assert!(err.to_string().contains("was not found"));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        let throttled = error_from_response("r", StatusCode::TOO_MANY_REQUESTS, "slow down");
        let unavailable = error_from_response("r", StatusCode::SERVICE_UNAVAILABLE, "");
        let forbidden = error_from_response(
            "r",
            StatusCode::FORBIDDEN,
            r#"{"error":{"code":403,"message":"Required 'compute.firewalls.create' permission"}}"#,
        );
        assert!(throttled.is_retryable());
        assert!(unavailable.is_retryable());
        assert!(forbidden.is_permanent());
    }

    #[test]
    fn firewall_pages_default_to_empty() {
        let page: FirewallList = serde_json::from_str(r#"{"kind":"compute#firewallList"}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
