//! In-process fakes for the provider, comment API and credentials.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::github::{CommentApi, CredentialProvider, IssueComment, IssueCommentUser};
use super::models::CommentRef;
use super::sandbox::{CreateSandboxRequest, SandboxApi, SandboxInfo};

#[derive(Default)]
struct SandboxState {
    next_id: u32,
    create_requests: Vec<CreateSandboxRequest>,
    create_preview: Option<String>,
    statuses: VecDeque<(String, Option<String>)>,
    default_status: Option<(String, Option<String>)>,
    status_calls: usize,
    delete_attempts: Vec<String>,
    deleted: Vec<String>,
    lifecycle_calls: usize,
    fail_create: bool,
    fail_status: bool,
    fail_delete: bool,
    fail_lifecycle: bool,
}

/// Scriptable sandbox provider. Status polls pop queued responses first and
/// fall back to the default (`running`, no preview URL).
#[derive(Default)]
pub struct FakeSandboxApi {
    state: Mutex<SandboxState>,
}

impl FakeSandboxApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap()
    }

    pub fn set_create_preview(&self, url: Option<&str>) {
        self.state().create_preview = url.map(str::to_string);
    }

    pub fn push_status(&self, status: &str, preview_url: Option<&str>) {
        self.state()
            .statuses
            .push_back((status.to_string(), preview_url.map(str::to_string)));
    }

    pub fn set_default_status(&self, status: &str, preview_url: Option<&str>) {
        self.state().default_status = Some((status.to_string(), preview_url.map(str::to_string)));
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_status(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state().fail_delete = fail;
    }

    pub fn fail_lifecycle(&self, fail: bool) {
        self.state().fail_lifecycle = fail;
    }

    pub fn create_requests(&self) -> Vec<CreateSandboxRequest> {
        self.state().create_requests.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    /// Sandboxes the provider actually removed.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Every delete issued, including the ones that failed.
    pub fn delete_attempts(&self) -> Vec<String> {
        self.state().delete_attempts.clone()
    }

    pub fn lifecycle_calls(&self) -> usize {
        self.state().lifecycle_calls
    }

    /// Total number of calls that reached the provider, failed ones included.
    pub fn remote_calls(&self) -> usize {
        let state = self.state();
        state.create_requests.len()
            + state.status_calls
            + state.delete_attempts.len()
            + state.lifecycle_calls
    }
}

#[async_trait]
impl SandboxApi for FakeSandboxApi {
    async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxInfo> {
        let mut state = self.state();
        state.create_requests.push(request.clone());
        if state.fail_create {
            return Err(anyhow!("provider unavailable"));
        }
        state.next_id += 1;
        Ok(SandboxInfo {
            id: Some(format!("sbx-{}", state.next_id)),
            preview_url: state.create_preview.clone(),
            status: "creating".to_string(),
        })
    }

    async fn status(&self, _sandbox_id: &str) -> Result<SandboxInfo> {
        let mut state = self.state();
        state.status_calls += 1;
        if state.fail_status {
            return Err(anyhow!("status lookup failed"));
        }
        let (status, preview_url) = state
            .statuses
            .pop_front()
            .or_else(|| state.default_status.clone())
            .unwrap_or_else(|| ("running".to_string(), None));
        Ok(SandboxInfo {
            id: None,
            preview_url,
            status,
        })
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let mut state = self.state();
        state.delete_attempts.push(sandbox_id.to_string());
        if state.fail_delete {
            return Err(anyhow!("delete failed"));
        }
        state.deleted.push(sandbox_id.to_string());
        Ok(())
    }

    async fn stop(&self, _sandbox_id: &str) -> Result<()> {
        let mut state = self.state();
        state.lifecycle_calls += 1;
        if state.fail_lifecycle {
            return Err(anyhow!("stop failed"));
        }
        Ok(())
    }

    async fn start(&self, _sandbox_id: &str) -> Result<()> {
        let mut state = self.state();
        state.lifecycle_calls += 1;
        if state.fail_lifecycle {
            return Err(anyhow!("start failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredComment {
    pub id: u64,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub author: String,
    pub body: String,
}

#[derive(Default)]
struct CommentState {
    next_id: u64,
    comments: Vec<StoredComment>,
    updates: usize,
    calls: usize,
    fail_writes: bool,
}

/// Comment API keeping comments in memory. Comments it creates are authored
/// by `bot_login`.
pub struct FakeCommentApi {
    bot_login: String,
    state: Mutex<CommentState>,
}

impl FakeCommentApi {
    pub fn new(bot_login: &str) -> Self {
        Self {
            bot_login: bot_login.to_string(),
            state: Mutex::new(CommentState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CommentState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, owner: &str, repo: &str, pr_number: u64, author: &str, body: &str) -> u64 {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.comments.push(StoredComment {
            id,
            owner: owner.to_string(),
            repo: repo.to_string(),
            pr_number,
            author: author.to_string(),
            body: body.to_string(),
        });
        id
    }

    pub fn comments(&self) -> Vec<StoredComment> {
        self.state().comments.clone()
    }

    pub fn updates(&self) -> usize {
        self.state().updates
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

fn comment_url(owner: &str, repo: &str, pr_number: u64, id: u64) -> String {
    format!(
        "https://github.com/{}/{}/pull/{}#issuecomment-{}",
        owner, repo, pr_number, id
    )
}

#[async_trait]
impl CommentApi for FakeCommentApi {
    async fn create_comment(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<CommentRef> {
        self.state().calls += 1;
        if self.state().fail_writes {
            return Err(anyhow!("502 Bad Gateway"));
        }
        let id = self.seed(owner, repo, pr_number, &self.bot_login, body);
        Ok(CommentRef {
            id,
            html_url: comment_url(owner, repo, pr_number, id),
        })
    }

    async fn list_comments(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<IssueComment>> {
        let mut state = self.state();
        state.calls += 1;
        let base = Utc::now();
        Ok(state
            .comments
            .iter()
            .filter(|c| c.owner == owner && c.repo == repo && c.pr_number == pr_number)
            .map(|c| IssueComment {
                id: c.id,
                body: Some(c.body.clone()),
                user: Some(IssueCommentUser {
                    login: c.author.clone(),
                }),
                html_url: comment_url(owner, repo, pr_number, c.id),
                created_at: base + Duration::seconds(c.id as i64),
            })
            .collect())
    }

    async fn update_comment(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<CommentRef> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_writes {
            return Err(anyhow!("502 Bad Gateway"));
        }
        let comment = state
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id && c.owner == owner && c.repo == repo)
            .ok_or_else(|| anyhow!("comment {} not found", comment_id))?;
        comment.body = body.to_string();
        let url = comment_url(owner, repo, comment.pr_number, comment_id);
        state.updates += 1;
        Ok(CommentRef {
            id: comment_id,
            html_url: url,
        })
    }
}

/// Credential provider backed by a fixed map; repos missing from it have no
/// credential.
#[derive(Default)]
pub struct FakeCredentials {
    tokens: HashMap<String, String>,
    resolutions: Mutex<usize>,
}

impl FakeCredentials {
    pub fn allowing(repos: &[&str]) -> Self {
        Self {
            tokens: repos
                .iter()
                .map(|r| (r.to_string(), format!("ghs_{}", r.replace('/', "_"))))
                .collect(),
            resolutions: Mutex::new(0),
        }
    }

    pub fn resolutions(&self) -> usize {
        *self.resolutions.lock().unwrap()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn token_for(&self, owner: &str, repo: &str) -> Option<String> {
        *self.resolutions.lock().unwrap() += 1;
        self.tokens.get(&format!("{}/{}", owner, repo)).cloned()
    }
}
