//! GitHub REST implementation of [`SourceHost`] and [`CiProvider`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ScmError;
use crate::types::{NewPullRequest, PullRequest, Repository, RunState, WorkflowJob, WorkflowRun};
use crate::{CiProvider, SourceHost};

/// Public GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Environment variable holding the API token.
const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

const PROVIDER: &str = "github";
const API_VERSION: &str = "2022-11-28";
const RUNS_PER_PAGE: u32 = 50;

/// GitHub REST client.
#[derive(Clone)]
pub struct GitHubProvider {
    api_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for GitHubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubProvider")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GitHubProvider {
    /// Create a client against `api_url` with an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ScmError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("remediator/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Create a client for api.github.com using `GITHUB_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, ScmError> {
        let token = std::env::var(ENV_GITHUB_TOKEN).ok();
        if token.is_none() {
            warn!("GITHUB_TOKEN not set, GitHub calls will be unauthenticated");
        }
        Self::new(DEFAULT_API_URL, token, Duration::from_secs(30))
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url,
            urlencoding::encode(owner),
            urlencoding::encode(repo)
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ScmError> {
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map non-success responses onto [`ScmError`].
async fn check_status(response: Response) -> Result<Response, ScmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|v| v == "0"));
    let url = response.url().path().to_string();
    let message = response.text().await.unwrap_or_default();

    debug!(status = %status, path = %url, "GitHub request failed");

    Err(if rate_limited {
        ScmError::RateLimited { provider: PROVIDER }
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ScmError::Unauthorized { provider: PROVIDER }
    } else if status == StatusCode::NOT_FOUND {
        ScmError::NotFound(url)
    } else {
        ScmError::Api {
            provider: PROVIDER,
            status: status.as_u16(),
            message,
        }
    })
}

#[async_trait]
impl SourceHost for GitHubProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest, ScmError> {
        let url = format!("{}/pulls", self.repo_url(&request.owner, &request.repo));
        let payload = CreatePullPayload {
            title: &request.title,
            body: &request.body,
            head: &request.head,
            base: &request.base,
            draft: request.draft,
        };

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&payload)
            .send()
            .await?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await?;
        let pull: GhPull = serde_json::from_slice(&bytes)?;

        info!(
            repository = %format!("{}/{}", request.owner, request.repo),
            number = pull.number,
            "Created pull request"
        );

        Ok(PullRequest {
            id: pull.id,
            number: pull.number,
            html_url: pull.html_url,
            title: pull.title,
            owner: request.owner.clone(),
            repository_name: request.repo.clone(),
        })
    }

    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError> {
        let gh: GhRepository = self.get_json(&self.repo_url(owner, repo)).await?;
        Ok(Repository {
            owner: gh.owner.login,
            name: gh.name,
            default_branch: gh.default_branch,
        })
    }
}

#[async_trait]
impl CiProvider for GitHubProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn list_completed_runs(
        &self,
        owner: &str,
        repo: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkflowRun>, ScmError> {
        let mut url = format!(
            "{}/actions/runs?status=completed&per_page={RUNS_PER_PAGE}",
            self.repo_url(owner, repo)
        );
        if let Some(since) = since {
            let filter = format!(">={}", since.format("%Y-%m-%dT%H:%M:%SZ"));
            url.push_str("&created=");
            url.push_str(&urlencoding::encode(&filter));
        }

        let list: GhRunList = self.get_json(&url).await?;
        debug!(
            repository = %format!("{owner}/{repo}"),
            count = list.workflow_runs.len(),
            "Listed workflow runs"
        );

        Ok(list
            .workflow_runs
            .into_iter()
            .map(|run| run.into_run(owner, repo))
            .collect())
    }

    async fn list_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<WorkflowJob>, ScmError> {
        let url = format!(
            "{}/actions/runs/{run_id}/jobs?filter=latest",
            self.repo_url(owner, repo)
        );
        let list: GhJobList = self.get_json(&url).await?;

        Ok(list
            .jobs
            .into_iter()
            .map(|job| WorkflowJob {
                id: job.id,
                run_id: job.run_id,
                name: job.name,
                conclusion: job.conclusion,
                completed_at: job.completed_at,
            })
            .collect())
    }

    async fn job_logs(&self, owner: &str, repo: &str, job_id: u64) -> Result<String, ScmError> {
        let url = format!("{}/actions/jobs/{job_id}/logs", self.repo_url(owner, repo));
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

// =============================================================================
// GitHub API types
// =============================================================================

#[derive(Debug, Serialize)]
struct CreatePullPayload<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
    draft: bool,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    id: u64,
    number: u64,
    html_url: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepository {
    name: String,
    owner: GhOwner,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GhRunList {
    #[serde(default)]
    workflow_runs: Vec<GhRun>,
}

#[derive(Debug, Deserialize)]
struct GhRun {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    head_branch: Option<String>,
    head_sha: String,
    status: Option<String>,
    conclusion: Option<String>,
    html_url: String,
    created_at: DateTime<Utc>,
    run_started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl GhRun {
    fn into_run(self, owner: &str, repo: &str) -> WorkflowRun {
        let state = match self.status.as_deref() {
            Some("queued" | "waiting" | "requested" | "pending") => RunState::Queued,
            Some("in_progress") => RunState::InProgress,
            _ => RunState::Completed,
        };

        WorkflowRun {
            id: self.id,
            owner: owner.to_string(),
            repository: repo.to_string(),
            workflow_name: self.name.unwrap_or_else(|| "unknown".to_string()),
            head_branch: self.head_branch.unwrap_or_default(),
            head_sha: self.head_sha,
            state,
            conclusion: self.conclusion,
            html_url: self.html_url,
            created_at: self.created_at,
            started_at: self.run_started_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhJobList {
    #[serde(default)]
    jobs: Vec<GhJob>,
}

#[derive(Debug, Deserialize)]
struct GhJob {
    id: u64,
    run_id: u64,
    name: String,
    conclusion: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}
