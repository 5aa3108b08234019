//! Thin typed client for the Forgejo Actions API.
//!
//! Covers the four endpoints the operator uses: listing pending jobs for an
//! organization, fetching runner registration tokens, listing organization
//! repositories, and fetching run metadata.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by the Forgejo client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned a non-2xx response.
    #[error("Forgejo API error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, surfaced for diagnosis.
        message: String,
    },

    /// Failed to deserialize a response body.
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),

    /// Invalid server URL provided.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Registration token response carried an empty token.
    #[error("registration token is empty in response")]
    EmptyRegistrationToken,

    /// No repository with the requested ID exists in the organization.
    #[error("repository with ID {0} not found")]
    RepositoryNotFound(i64),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// A Forgejo Actions job as returned by the jobs endpoint.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub repo_id: i64,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub status: String,
}

/// A Forgejo repository.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Repository {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub default_branch: String,
    #[serde(default)]
    pub html_url: String,
}

/// User that triggered a run.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct TriggerUser {
    #[serde(default)]
    pub login: String,
}

/// A Forgejo Actions run.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Run {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "prettyref")]
    pub pretty_ref: String,
    #[serde(default)]
    pub trigger_user: TriggerUser,
    #[serde(default)]
    pub trigger_event: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Deserialize)]
struct RegistrationTokenResponse {
    #[serde(default)]
    token: String,
}

/// Client for the Forgejo Actions API.
#[derive(Debug, Clone)]
pub struct Client {
    server_url: String,
    token: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a client with TLS verification enabled.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Self::with_tls(server_url, token, false)
    }

    /// Create a client, optionally skipping TLS certificate verification.
    pub fn with_tls(
        server_url: impl Into<String>,
        token: impl Into<String>,
        skip_tls_verify: bool,
    ) -> Result<Self> {
        let server_url = server_url.into();
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(ClientError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {server_url}"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()?;

        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    /// Fetch the body of `url`, surfacing non-2xx responses as [`ClientError::Api`].
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body)
    }

    /// Fetch jobs pending for `org`, filtered to those still waiting for a runner.
    ///
    /// The `labels` filter is passed through to Forgejo verbatim, commas included.
    pub async fn pending_jobs(&self, org: &str, labels: &str) -> Result<Vec<Job>> {
        let url = format!(
            "{}/api/v1/orgs/{}/actions/runners/jobs?labels={}",
            self.server_url, org, labels
        );
        let body = self.get_text(&url).await?;
        decode_jobs(&body)
    }

    /// Fetch a one-shot runner registration token for `org`.
    pub async fn registration_token(&self, org: &str) -> Result<String> {
        let url = format!(
            "{}/api/v1/orgs/{}/actions/runners/registration-token",
            self.server_url, org
        );
        let body = self.get_text(&url).await?;
        decode_registration_token(&body)
    }

    /// Fetch the repository with `repo_id` from `org`'s repository list.
    pub async fn repository(&self, org: &str, repo_id: i64) -> Result<Repository> {
        let url = format!("{}/api/v1/orgs/{}/repos", self.server_url, org);
        let body = self.get_text(&url).await?;
        let repos: Vec<Repository> = serde_json::from_str(&body)?;
        repos
            .into_iter()
            .find(|repo| repo.id == repo_id)
            .ok_or(ClientError::RepositoryNotFound(repo_id))
    }

    /// Fetch run metadata by ID from a repository.
    pub async fn run(&self, owner: &str, repo: &str, run_id: i64) -> Result<Run> {
        let url = format!(
            "{}/api/v1/repos/{}/{}/actions/runs/{}",
            self.server_url, owner, repo, run_id
        );
        let body = self.get_text(&url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Decode the jobs endpoint body. Forgejo answers `null` (or nothing) when the
/// queue is empty; jobs not in status "waiting" are dropped.
fn decode_jobs(body: &str) -> Result<Vec<Job>> {
    let body = body.trim();
    if body.is_empty() || body == "null" {
        return Ok(Vec::new());
    }

    let jobs: Vec<Job> = serde_json::from_str(body)?;
    Ok(jobs.into_iter().filter(|job| job.status == "waiting").collect())
}

fn decode_registration_token(body: &str) -> Result<String> {
    let response: RegistrationTokenResponse = serde_json::from_str(body)?;
    if response.token.is_empty() {
        return Err(ClientError::EmptyRegistrationToken);
    }
    Ok(response.token)
}
