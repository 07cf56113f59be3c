use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::models::Repository;
use octocrab::Octocrab;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Credentials;

/// A repository as reported by the organization listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepo {
    pub name: String,
    pub full_name: String,
    pub ssh_url: String,
    pub default_branch: Option<String>,
    pub archived: bool,
    pub fork: bool,
}

impl RemoteRepo {
    /// Descriptor for `org/name` with the conventional GitHub SSH URL
    pub fn new(org: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        let full_name = format!("{}/{}", org, name);
        Self {
            ssh_url: ssh_url_for(&full_name),
            full_name,
            name,
            default_branch: None,
            archived: false,
            fork: false,
        }
    }

    fn from_octocrab(org: &str, repo: Repository) -> Self {
        let full_name = repo
            .full_name
            .clone()
            .unwrap_or_else(|| format!("{}/{}", org, repo.name));

        // Prefer the SSH URL the API reports, otherwise build the conventional one
        let ssh_url = repo
            .ssh_url
            .clone()
            .unwrap_or_else(|| ssh_url_for(&full_name));

        Self {
            name: repo.name,
            full_name,
            ssh_url,
            default_branch: repo.default_branch,
            archived: repo.archived.unwrap_or(false),
            fork: repo.fork.unwrap_or(false),
        }
    }
}

fn ssh_url_for(full_name: &str) -> String {
    format!("git@github.com:{}.git", full_name)
}

/// One page of the organization listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPage {
    /// 1-based page number this batch was fetched with
    pub number: u32,
    pub repos: Vec<RemoteRepo>,
    /// `None` once the listing is exhausted
    pub next_page: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("listing page timed out after {0:?}")]
    Timeout(Duration),

    #[error("run deadline exceeded")]
    DeadlineExceeded,

    #[error("GitHub API error: {0}")]
    Api(String),
}

impl ListError {
    /// Whether the same page may be requested again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ListError::Api(_) | ListError::Timeout(_))
    }
}

impl From<octocrab::Error> for ListError {
    fn from(err: octocrab::Error) -> Self {
        if is_rate_limit_error(&err) {
            ListError::RateLimited(err.to_string())
        } else {
            ListError::Api(err.to_string())
        }
    }
}

/// HTTP 429, or a 403 whose message mentions the rate limit
pub fn is_rate_limit_error(err: &octocrab::Error) -> bool {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            status == 429
                || (status == 403 && source.message.to_lowercase().contains("rate limit"))
        }
        _ => false,
    }
}

/// Source of paginated organization repository listings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Fetch one page of `org`'s repositories
    async fn list_page(&self, org: &str, page: u32, per_page: u8) -> Result<RepoPage, ListError>;
}

/// GitHub client wrapper authenticated with a personal token
pub struct GitHubClient {
    client: Octocrab,
}

impl GitHubClient {
    /// Create a client for api.github.com
    pub fn new(credentials: &Credentials) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(credentials.token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self { client })
    }

    /// Create a client against a different API root (GitHub Enterprise, test servers)
    pub fn with_base_uri(credentials: &Credentials, base_uri: &str) -> Result<Self> {
        let client = Octocrab::builder()
            .base_uri(base_uri)
            .with_context(|| format!("Invalid GitHub API base URI: {}", base_uri))?
            .personal_token(credentials.token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RepoSource for GitHubClient {
    async fn list_page(&self, org: &str, page: u32, per_page: u8) -> Result<RepoPage, ListError> {
        debug!("Fetching repositories for organization {} page {}", org, page);

        let response = self
            .client
            .orgs(org)
            .list_repos()
            .per_page(per_page)
            .page(page)
            .send()
            .await?;

        let next_page = response.next.as_ref().map(|_| page + 1);
        let repos: Vec<RemoteRepo> = response
            .items
            .into_iter()
            .map(|repo| RemoteRepo::from_octocrab(org, repo))
            .collect();

        debug!(
            "Page {} of {} returned {} repositories (more: {})",
            page,
            org,
            repos.len(),
            next_page.is_some()
        );

        Ok(RepoPage {
            number: page,
            repos,
            next_page,
        })
    }
}
