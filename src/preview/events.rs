//! Pull-request webhook payloads, narrowed into a closed event type.
//!
//! The raw structs mirror the subset of the GitHub payload we read, with
//! every field optional. `PullRequestEvent::from_slice` validates the fields
//! each action needs so the controller only ever sees complete events.

use serde::Deserialize;

use crate::errors::WebhookError;

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    action: Option<String>,
    pull_request: Option<RawPullRequest>,
    repository: Option<RawRepository>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPullRequest {
    number: Option<u64>,
    head: Option<RawHead>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHead {
    #[serde(rename = "ref")]
    ref_name: Option<String>,
    repo: Option<RawHeadRepo>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeadRepo {
    full_name: Option<String>,
    clone_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRepository {
    full_name: Option<String>,
    name: Option<String>,
    owner: Option<RawOwner>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOwner {
    login: Option<String>,
}

/// The base repository a pull request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub full_name: String,
}

impl RepoRef {
    /// Split an `owner/name` string.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            full_name: full_name.to_string(),
        })
    }
}

/// Everything needed to provision a workspace for a pull request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestContext {
    pub repo: RepoRef,
    pub pr_number: u64,
    pub branch: String,
    pub clone_url: String,
}

/// A validated pull-request lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestEvent {
    Opened(PullRequestContext),
    Synchronize(PullRequestContext),
    Reopened(PullRequestContext),
    Closed { repo: RepoRef, pr_number: u64 },
    Other { action: String },
}

impl PullRequestEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, WebhookError> {
        let raw: RawPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(format!("Invalid JSON: {}", e)))?;
        Self::from_raw(raw)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, WebhookError> {
        let raw: RawPayload = serde_json::from_value(value)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawPayload) -> Result<Self, WebhookError> {
        let action = raw
            .action
            .ok_or_else(|| invalid("missing action"))?;

        match action.as_str() {
            "opened" => Ok(Self::Opened(context(raw.pull_request, raw.repository)?)),
            "synchronize" => Ok(Self::Synchronize(context(raw.pull_request, raw.repository)?)),
            "reopened" => Ok(Self::Reopened(context(raw.pull_request, raw.repository)?)),
            "closed" => {
                let pr_number = raw
                    .pull_request
                    .and_then(|pr| pr.number)
                    .ok_or_else(|| invalid("missing pull_request.number"))?;
                Ok(Self::Closed {
                    repo: repo_ref(raw.repository)?,
                    pr_number,
                })
            }
            _ => Ok(Self::Other { action }),
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Self::Opened(_) => "opened",
            Self::Synchronize(_) => "synchronize",
            Self::Reopened(_) => "reopened",
            Self::Closed { .. } => "closed",
            Self::Other { action } => action,
        }
    }

    /// The (repository, PR) key the event applies to, if any.
    pub fn key(&self) -> Option<(&str, u64)> {
        match self {
            Self::Opened(ctx) | Self::Synchronize(ctx) | Self::Reopened(ctx) => {
                Some((ctx.repo.full_name.as_str(), ctx.pr_number))
            }
            Self::Closed { repo, pr_number } => Some((repo.full_name.as_str(), *pr_number)),
            Self::Other { .. } => None,
        }
    }
}

fn invalid(msg: &str) -> WebhookError {
    WebhookError::InvalidPayload(msg.to_string())
}

fn repo_ref(raw: Option<RawRepository>) -> Result<RepoRef, WebhookError> {
    let raw = raw.ok_or_else(|| invalid("missing repository"))?;
    let full_name = raw
        .full_name
        .ok_or_else(|| invalid("missing repository.full_name"))?;
    let derived =
        RepoRef::parse(&full_name).ok_or_else(|| invalid("malformed repository.full_name"))?;

    // Explicit owner/name win over the split full name.
    Ok(RepoRef {
        owner: raw.owner.and_then(|o| o.login).unwrap_or(derived.owner),
        name: raw.name.unwrap_or(derived.name),
        full_name,
    })
}

fn context(
    pull_request: Option<RawPullRequest>,
    repository: Option<RawRepository>,
) -> Result<PullRequestContext, WebhookError> {
    let pr = pull_request.ok_or_else(|| invalid("missing pull_request"))?;
    let pr_number = pr.number.ok_or_else(|| invalid("missing pull_request.number"))?;
    let head = pr.head.ok_or_else(|| invalid("missing pull_request.head"))?;
    let branch = head
        .ref_name
        .filter(|r| !r.is_empty())
        .ok_or_else(|| invalid("missing pull_request.head.ref"))?;
    let repo = repo_ref(repository)?;

    let head_repo = head.repo.unwrap_or_default();
    let clone_url = match (head_repo.clone_url, head_repo.full_name) {
        (Some(url), _) => url,
        (None, Some(name)) => format!("https://github.com/{}.git", name),
        (None, None) => return Err(invalid("missing pull_request.head.repo.clone_url")),
    };

    Ok(PullRequestContext {
        repo,
        pr_number,
        branch,
        clone_url,
    })
}
