//! GitHub REST client for repositories, forks, pull requests and Actions runs.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::capabilities::PullRequestDraft;
use crate::error::{CiError, RepoError};

pub const GITHUB_API_URL: &str = "https://api.github.com";

/// A workflow run as returned by the Actions API.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: Option<String>,
    pub head_sha: String,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: Option<String>,
    /// `success`, `failure`, `cancelled`, ... once completed
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunList {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

/// One job of a workflow run.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub name: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobList {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

/// Repository metadata, as returned by the repository and fork endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub owner: Account,
    /// Absent while a fresh fork is still being provisioned
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Only present on authenticated requests
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
}

/// Fork readiness polling: 3s, then 2s longer per attempt up to 10s.
const FORK_POLL_INITIAL: Duration = Duration::from_secs(3);
const FORK_POLL_STEP: Duration = Duration::from_secs(2);
const FORK_POLL_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    html_url: String,
}

/// Thin GitHub API client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Create a client against `api_base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("autoheal/0.1"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Token used for API calls and authenticated git remotes.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Repository metadata, including the caller's permissions when authenticated.
    pub async fn repository(&self, owner: &str, repo: &str) -> Result<RepositoryInfo, RepoError> {
        let url = format!("{}/repos/{owner}/{repo}", self.api_base);
        let response = self.send_repo(self.client.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|e| RepoError::Command(format!("Invalid repository response: {e}")))
    }

    /// Whether the authenticated identity may push to `owner/repo`.
    pub async fn can_push(&self, owner: &str, repo: &str) -> Result<bool, RepoError> {
        if self.token.is_none() {
            return Ok(false);
        }
        let info = self.repository(owner, repo).await?;
        Ok(info.permissions.is_some_and(|p| p.push || p.admin))
    }

    /// Fork `owner/repo` into the authenticated account.
    ///
    /// GitHub creates forks asynchronously; see [`Self::wait_for_repository`].
    pub async fn create_fork(&self, owner: &str, repo: &str) -> Result<RepositoryInfo, RepoError> {
        let url = format!("{}/repos/{owner}/{repo}/forks", self.api_base);
        let response = self.send_repo(self.client.post(&url)).await?;
        let fork: RepositoryInfo = response
            .json()
            .await
            .map_err(|e| RepoError::Command(format!("Invalid fork response: {e}")))?;
        info!(fork = %fork.full_name, "Fork requested");
        Ok(fork)
    }

    /// Poll until `owner/repo` answers with a default branch, or `timeout`
    /// elapses. Returns whether the repository became ready.
    pub async fn wait_for_repository(&self, owner: &str, repo: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut interval = FORK_POLL_INITIAL;
        loop {
            match self.repository(owner, repo).await {
                Ok(info) if info.default_branch.is_some() => return true,
                Ok(_) => debug!(owner, repo, "Repository has no default branch yet"),
                Err(e) => debug!(owner, repo, error = %e, "Repository not available yet"),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            sleep(interval.min(remaining)).await;
            interval = (interval + FORK_POLL_STEP).min(FORK_POLL_MAX);
        }
    }

    /// Open a pull request and return its URL.
    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        draft: &PullRequestDraft,
    ) -> Result<String, RepoError> {
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.api_base);
        let body = CreatePullRequest {
            title: &draft.title,
            head: &draft.head,
            base: &draft.base,
            body: &draft.body,
        };

        let response = self.send_repo(self.client.post(&url).json(&body)).await?;
        let created: PullRequestResponse = response
            .json()
            .await
            .map_err(|e| RepoError::Command(format!("Invalid pull request response: {e}")))?;
        debug!(url = %created.html_url, "Pull request created");
        Ok(created.html_url)
    }

    /// Workflow runs for `branch` at `head_sha`.
    pub async fn workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        head_sha: &str,
    ) -> Result<Vec<WorkflowRun>, CiError> {
        let url = format!("{}/repos/{owner}/{repo}/actions/runs", self.api_base);
        let request = self
            .client
            .get(&url)
            .query(&[("branch", branch), ("head_sha", head_sha), ("per_page", "30")]);

        let response = self.send_ci(request).await?;
        let list: WorkflowRunList = response
            .json()
            .await
            .map_err(|e| CiError::Fatal(format!("Invalid workflow run list: {e}")))?;

        Ok(list
            .workflow_runs
            .into_iter()
            .filter(|run| run.head_sha == head_sha)
            .collect())
    }

    /// Jobs of one workflow run.
    pub async fn workflow_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<WorkflowJob>, CiError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/actions/runs/{run_id}/jobs",
            self.api_base
        );
        let response = self.send_ci(self.client.get(&url)).await?;
        let list: WorkflowJobList = response
            .json()
            .await
            .map_err(|e| CiError::Fatal(format!("Invalid job list: {e}")))?;
        Ok(list.jobs)
    }

    async fn send_repo(&self, request: RequestBuilder) -> Result<Response, RepoError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("GitHub API error: {status} - {body}");
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepoError::Auth(message),
            StatusCode::UNPROCESSABLE_ENTITY => RepoError::Conflict(message),
            s if s.is_server_error() => RepoError::Network(message),
            _ => RepoError::Command(message),
        })
    }

    async fn send_ci(&self, request: RequestBuilder) -> Result<Response, CiError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| CiError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("GitHub API error: {status} - {body}");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(CiError::Transient(message))
        } else {
            Err(CiError::Fatal(message))
        }
    }
}
