//! GitHub-backed forge gateway.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{ForgeGateway, ForgeIssue, IssueComment, IssuePatch, IssueQuery, NewIssue};
use crate::config::ForgeConfig;
use crate::gateway::GatewayError;
use crate::model::{IssueState, StateReason};
use crate::redact::redact;

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "taskbridge/forge-github";
const DEFAULT_PAGE_SIZE: u32 = 100;

/// Longest in-call wait on a rate-limit reset before giving up and
/// surfacing `RateLimited` to the caller.
const MAX_RESET_WAIT: Duration = Duration::from_secs(120);

/// GitHub implementation of [`ForgeGateway`].
pub struct GithubForge {
    repo: String,
    token: SecretString,
    api_base_url: String,
    client: reqwest::Client,
}

impl GithubForge {
    /// Builds a gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the repository slug or base URL is
    /// malformed, or the HTTP client cannot be constructed.
    pub fn new(cfg: &ForgeConfig) -> Result<Self, GatewayError> {
        let repo = cfg.repo_slug();
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(GatewayError::InvalidRequest(format!(
                "repository slug must be owner/repo, got {repo:?}"
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(cfg.deadline)
            .build()
            .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;

        Ok(Self {
            repo,
            token: cfg.token.clone(),
            api_base_url: cfg.api_base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.api_base_url)
    }

    /// Sends one request, honoring an advertised rate-limit reset with a
    /// single in-call retry.
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut retried = false;
        loop {
            let mut builder = self
                .client
                .request(method.clone(), self.url(endpoint))
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", USER_AGENT)
                .header("X-GitHub-Api-Version", API_VERSION)
                .bearer_auth(self.token.expose_secret());
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(payload) = &body {
                builder = builder.json(payload);
            }

            debug!(method = %method, endpoint, "forge request");
            let response = builder.send().await.map_err(map_transport_error)?;

            if let Some(wait) = rate_limit_wait(&response) {
                if retried || wait > MAX_RESET_WAIT {
                    return Err(GatewayError::RateLimited { retry_after: wait });
                }
                warn!(endpoint, wait_secs = wait.as_secs(), "forge rate limited, waiting");
                tokio::time::sleep(wait).await;
                retried = true;
                continue;
            }

            return Ok(response);
        }
    }

    async fn expect_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(status, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|err| GatewayError::Transient(format!("response decode failed: {err}")))
    }
}

#[async_trait::async_trait]
impl ForgeGateway for GithubForge {
    fn repo(&self) -> &str {
        &self.repo
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<ForgeIssue, GatewayError> {
        let endpoint = format!("/repos/{}/issues", self.repo);
        let mut payload = json!({
            "title": issue.title,
            "body": issue.body,
        });
        if !issue.labels.is_empty() {
            payload["labels"] = json!(issue.labels);
        }
        if !issue.assignees.is_empty() {
            payload["assignees"] = json!(issue.assignees);
        }

        let response = self.send(Method::POST, &endpoint, &[], Some(payload)).await?;
        let raw: RestIssue = Self::expect_json(response).await?;
        raw.try_into()
    }

    async fn get_issue(&self, number: u64) -> Result<ForgeIssue, GatewayError> {
        let endpoint = format!("/repos/{}/issues/{number}", self.repo);
        let response = self.send(Method::GET, &endpoint, &[], None).await?;
        let raw: RestIssue = Self::expect_json(response).await?;
        raw.try_into()
    }

    async fn update_issue(
        &self,
        number: u64,
        patch: &IssuePatch,
    ) -> Result<ForgeIssue, GatewayError> {
        if patch.is_empty() {
            return self.get_issue(number).await;
        }

        let mut payload = serde_json::Map::new();
        if let Some(title) = &patch.title {
            payload.insert("title".into(), json!(title));
        }
        if let Some(body) = &patch.body {
            payload.insert("body".into(), json!(body));
        }
        if let Some(state) = patch.state {
            payload.insert("state".into(), json!(state.as_str()));
        }
        if let Some(reason) = patch.state_reason {
            payload.insert("state_reason".into(), json!(reason.as_str()));
        }
        if let Some(labels) = &patch.labels {
            payload.insert("labels".into(), json!(labels));
        }
        if let Some(assignees) = &patch.assignees {
            payload.insert("assignees".into(), json!(assignees));
        }

        let endpoint = format!("/repos/{}/issues/{number}", self.repo);
        let response = self
            .send(Method::PATCH, &endpoint, &[], Some(payload.into()))
            .await?;
        let raw: RestIssue = Self::expect_json(response).await?;
        raw.try_into()
    }

    async fn list_issues(&self, query: &IssueQuery) -> Result<Vec<ForgeIssue>, GatewayError> {
        let mut params: Vec<(String, String)> = vec![
            ("state".into(), query.state.as_str().into()),
            (
                "per_page".into(),
                query.per_page.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
            ),
        ];
        if !query.labels.is_empty() {
            params.push(("labels".into(), query.labels.join(",")));
        }
        if let Some(assignee) = &query.assignee {
            params.push(("assignee".into(), assignee.clone()));
        }
        if let Some(since) = query.since {
            params.push(("since".into(), since.to_rfc3339()));
        }
        if let Some(page) = query.page {
            params.push(("page".into(), page.to_string()));
        }

        let endpoint = format!("/repos/{}/issues", self.repo);
        let response = self.send(Method::GET, &endpoint, &params, None).await?;
        let raw: Vec<RestIssue> = Self::expect_json(response).await?;

        // The issues endpoint also returns pull requests; drop them.
        raw.into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(TryInto::try_into)
            .collect()
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<u64, GatewayError> {
        let endpoint = format!("/repos/{}/issues/{number}/comments", self.repo);
        let response = self
            .send(Method::POST, &endpoint, &[], Some(json!({ "body": body })))
            .await?;
        let raw: RestComment = Self::expect_json(response).await?;
        Ok(raw.id)
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GatewayError> {
        let endpoint = format!("/repos/{}/issues/{number}/comments", self.repo);
        let params = [("per_page".to_string(), DEFAULT_PAGE_SIZE.to_string())];
        let response = self.send(Method::GET, &endpoint, &params, None).await?;
        let raw: Vec<RestComment> = Self::expect_json(response).await?;

        Ok(raw
            .into_iter()
            .map(|comment| IssueComment {
                id: comment.id,
                author: comment.user.map(|user| user.login).unwrap_or_default(),
                body: comment.body.unwrap_or_default(),
                created_at: comment.created_at,
            })
            .collect())
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Transient(err.to_string())
}

/// Detects an in-force rate limit and returns how long to wait.
///
/// GitHub signals limits as 429, or as 403 with a zeroed remaining-quota
/// header; the reset header carries an epoch second.
fn rate_limit_wait(response: &reqwest::Response) -> Option<Duration> {
    let status = response.status();
    let headers = response.headers();
    let exhausted = header_str(headers, "x-ratelimit-remaining") == Some("0");
    if status != StatusCode::TOO_MANY_REQUESTS && !(status == StatusCode::FORBIDDEN && exhausted) {
        return None;
    }

    let wait = header_str(headers, "x-ratelimit-reset")
        .and_then(|raw| raw.parse::<i64>().ok())
        .map_or(Duration::from_secs(60), |reset| {
            let delta = reset - Utc::now().timestamp();
            Duration::from_secs(delta.max(1).unsigned_abs())
        });
    Some(wait)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn error_for_status(status: StatusCode, response: reqwest::Response) -> GatewayError {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_owned());
    let message = format!("{}: {}", status.as_u16(), redact(&body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => GatewayError::NotFound(message),
        StatusCode::CONFLICT => GatewayError::Conflict(message),
        status if status.is_server_error() => GatewayError::Transient(message),
        _ => GatewayError::InvalidRequest(message),
    }
}

// Wire shapes, private to this provider.

#[derive(Debug, Deserialize)]
struct RestUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RestLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    state_reason: Option<String>,
    #[serde(default)]
    labels: Vec<RestLabel>,
    #[serde(default)]
    assignees: Vec<RestUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pull_request: Option<serde_json::Value>,
}

impl TryFrom<RestIssue> for ForgeIssue {
    type Error = GatewayError;

    fn try_from(raw: RestIssue) -> Result<Self, GatewayError> {
        let state = IssueState::parse(&raw.state).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unexpected issue state {:?}", raw.state))
        })?;
        Ok(Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            state,
            state_reason: raw.state_reason.as_deref().and_then(StateReason::parse),
            labels: raw.labels.into_iter().map(|label| label.name).collect(),
            assignees: raw.assignees.into_iter().map(|user| user.login).collect(),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RestComment {
    id: u64,
    body: Option<String>,
    user: Option<RestUser>,
    created_at: DateTime<Utc>,
}
