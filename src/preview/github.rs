use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::models::CommentRef;
use crate::errors::CommentError;

const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "pr-preview";
const COMMENTS_PER_PAGE: usize = 100;
const GITHUB_API_VERSION: &str = "2022-11-28";
/// GitHub rejects app JWTs that live longer than ten minutes.
const APP_JWT_TTL_SECS: i64 = 600;
/// Backdate `iat` to tolerate clock drift.
const APP_JWT_BACKDATE_SECS: i64 = 60;

/// Hidden marker carried by every comment this service writes.
pub const COMMENT_MARKER: &str = "<!-- pr-preview -->";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Validate that a string looks like a GitHub token based on its prefix.
///
/// Format check only; the token may still be expired or under-scoped.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// A PR (issue) comment, subset of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    /// Null for comments by deleted accounts.
    pub user: Option<IssueCommentUser>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCommentUser {
    pub login: String,
}

impl IssueComment {
    fn author(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    fn to_ref(&self) -> CommentRef {
        CommentRef {
            id: self.id,
            html_url: self.html_url.clone(),
        }
    }
}

/// Abstraction over the comment endpoints of the code host.
/// Real implementation: `GitHubClient`.
#[async_trait]
pub trait CommentApi: Send + Sync {
    async fn create_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> anyhow::Result<CommentRef>;

    async fn list_comments(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> anyhow::Result<Vec<IssueComment>>;

    async fn update_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> anyhow::Result<CommentRef>;
}

/// GitHub REST client for issue comments.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new(DEFAULT_GITHUB_API_URL)
    }
}

impl GitHubClient {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Deserialize)]
struct CreatedComment {
    id: u64,
    html_url: String,
}

#[async_trait]
impl CommentApi for GitHubClient {
    async fn create_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> anyhow::Result<CommentRef> {
        let created: CreatedComment = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/issues/{}/comments", owner, repo, pr_number),
                token,
            )
            .json(&CommentBody { body })
            .send()
            .await
            .context("Failed to send create-comment request to GitHub")?
            .error_for_status()
            .context("GitHub create-comment API returned error status")?
            .json()
            .await
            .context("Failed to parse create-comment response from GitHub")?;
        Ok(CommentRef {
            id: created.id,
            html_url: created.html_url,
        })
    }

    /// Paginates through all pages automatically.
    async fn list_comments(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> anyhow::Result<Vec<IssueComment>> {
        let path = format!("/repos/{}/{}/issues/{}/comments", owner, repo, pr_number);
        let mut all_comments = Vec::new();
        let mut page = 1u32;

        loop {
            let resp: Vec<IssueComment> = self
                .request(reqwest::Method::GET, &path, token)
                .query(&[
                    ("per_page", COMMENTS_PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await
                .context("Failed to send list-comments request to GitHub")?
                .error_for_status()
                .context("GitHub list-comments API returned error status")?
                .json()
                .await
                .context("Failed to parse list-comments response from GitHub")?;

            let count = resp.len();
            all_comments.extend(resp);

            if count < COMMENTS_PER_PAGE {
                break; // Last page
            }
            page += 1;
        }

        Ok(all_comments)
    }

    async fn update_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> anyhow::Result<CommentRef> {
        let updated: CreatedComment = self
            .request(
                reqwest::Method::PATCH,
                &format!("/repos/{}/{}/issues/comments/{}", owner, repo, comment_id),
                token,
            )
            .json(&CommentBody { body })
            .send()
            .await
            .context("Failed to send update-comment request to GitHub")?
            .error_for_status()
            .context("GitHub update-comment API returned error status")?
            .json()
            .await
            .context("Failed to parse update-comment response from GitHub")?;
        Ok(CommentRef {
            id: updated.id,
            html_url: updated.html_url,
        })
    }
}

// ── Credentials ──────────────────────────────────────────────────────

/// Issues a token able to comment on one repository.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` when no usable credential exists for the repository.
    async fn token_for(&self, owner: &str, repo: &str) -> Option<String>;
}

/// Uses the same token for every repository.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn token_for(&self, _owner: &str, _repo: &str) -> Option<String> {
        Some(self.token.clone())
    }
}

/// One app installation covering a repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Installation {
    pub repo: String,
    pub installation_id: u64,
    /// Pre-issued token; unset when tokens are minted through the app.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub suspended: bool,
}

/// Read-only `owner/repo` to installation lookup.
#[derive(Debug, Clone, Default)]
pub struct InstallationDirectory {
    by_repo: HashMap<String, Installation>,
}

impl InstallationDirectory {
    pub fn new(installations: impl IntoIterator<Item = Installation>) -> Self {
        Self {
            by_repo: installations
                .into_iter()
                .map(|inst| (inst.repo.to_ascii_lowercase(), inst))
                .collect(),
        }
    }

    pub fn lookup(&self, owner: &str, repo: &str) -> Option<&Installation> {
        self.by_repo
            .get(&format!("{}/{}", owner, repo).to_ascii_lowercase())
    }

    /// The installation for a repository, unless it is unknown or suspended.
    pub fn usable(&self, owner: &str, repo: &str) -> Option<&Installation> {
        let installation = self.lookup(owner, repo)?;
        if installation.suspended {
            warn!(
                repo = %installation.repo,
                installation_id = installation.installation_id,
                "installation is suspended"
            );
            return None;
        }
        Some(installation)
    }

    pub fn len(&self) -> usize {
        self.by_repo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_repo.is_empty()
    }
}

#[async_trait]
impl CredentialProvider for InstallationDirectory {
    async fn token_for(&self, owner: &str, repo: &str) -> Option<String> {
        self.usable(owner, repo)?.token.clone()
    }
}

/// Identity of a GitHub App: its numeric id and RSA private key in PEM form.
#[derive(Clone, PartialEq, Eq)]
pub struct GitHubAppCredentials {
    pub app_id: String,
    pub private_key: String,
}

impl fmt::Debug for GitHubAppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubAppCredentials")
            .field("app_id", &self.app_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationAccessToken {
    token: String,
}

/// Mints short-lived installation tokens through GitHub App authentication.
///
/// Every call signs a fresh app JWT and exchanges it for an installation
/// token, so one token serves one logical operation. The installation is
/// resolved through the directory; unknown and suspended repositories get
/// nothing.
pub struct GitHubAppTokenProvider {
    credentials: GitHubAppCredentials,
    directory: InstallationDirectory,
    client: reqwest::Client,
    api_url: String,
}

impl GitHubAppTokenProvider {
    pub fn new(
        credentials: GitHubAppCredentials,
        directory: InstallationDirectory,
        api_url: &str,
    ) -> Self {
        Self {
            credentials,
            directory,
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn app_jwt(&self, now: i64) -> anyhow::Result<String> {
        let claims = AppClaims {
            iat: now - APP_JWT_BACKDATE_SECS,
            exp: now + APP_JWT_TTL_SECS,
            iss: self.credentials.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .context("GitHub App private key is not a valid RSA PEM")?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .context("Failed to sign GitHub App JWT")
    }

    /// Exchange a fresh app JWT for an installation access token.
    pub async fn mint_installation_token(&self, installation_id: u64) -> anyhow::Result<String> {
        let jwt = self.app_jwt(Utc::now().timestamp())?;
        let minted: InstallationAccessToken = self
            .client
            .post(format!(
                "{}/app/installations/{}/access_tokens",
                self.api_url, installation_id
            ))
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .send()
            .await
            .context("Failed to send installation token request to GitHub")?
            .error_for_status()
            .context("GitHub installation token API returned error status")?
            .json()
            .await
            .context("Failed to parse installation token response from GitHub")?;
        Ok(minted.token)
    }
}

#[async_trait]
impl CredentialProvider for GitHubAppTokenProvider {
    async fn token_for(&self, owner: &str, repo: &str) -> Option<String> {
        let installation_id = self.directory.usable(owner, repo)?.installation_id;
        match self.mint_installation_token(installation_id).await {
            Ok(token) => {
                debug!(installation_id, "minted installation token");
                Some(token)
            }
            Err(e) => {
                warn!(installation_id, "failed to mint installation token: {:#}", e);
                None
            }
        }
    }
}

/// Tries each provider in order and returns the first credential found.
pub struct ChainedProvider {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainedProvider {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl CredentialProvider for ChainedProvider {
    async fn token_for(&self, owner: &str, repo: &str) -> Option<String> {
        for provider in &self.providers {
            if let Some(token) = provider.token_for(owner, repo).await {
                return Some(token);
            }
        }
        None
    }
}

// ── Comment bodies ───────────────────────────────────────────────────

pub fn render_preview_comment(preview_url: &str, workspace_id: &str) -> String {
    format!(
        "{}\n## Preview environment ready\n\n\
         Your changes are live at **[{url}]({url})**\n\n\
         Workspace: `{}`\n\n\
         ---\n*This preview is rebuilt on every push and removed when the pull request closes.*",
        COMMENT_MARKER,
        workspace_id,
        url = preview_url,
    )
}

pub fn render_cleanup_comment(workspace_id: &str) -> String {
    format!(
        "{}\n## Preview environment removed\n\n\
         The pull request was closed, so workspace `{}` has been cleaned up.",
        COMMENT_MARKER, workspace_id
    )
}

// ── Synchronizer ─────────────────────────────────────────────────────

/// Keeps the bot's single comment on a PR in line with the preview state.
///
/// Credentials are resolved per logical operation and never cached across
/// calls.
pub struct CommentSynchronizer {
    api: Arc<dyn CommentApi>,
    credentials: Arc<dyn CredentialProvider>,
    bot_login: String,
}

impl CommentSynchronizer {
    pub fn new(
        api: Arc<dyn CommentApi>,
        credentials: Arc<dyn CredentialProvider>,
        bot_login: impl Into<String>,
    ) -> Self {
        Self {
            api,
            credentials,
            bot_login: bot_login.into(),
        }
    }

    pub fn bot_login(&self) -> &str {
        &self.bot_login
    }

    async fn token(&self, owner: &str, repo: &str) -> Result<String, CommentError> {
        self.credentials
            .token_for(owner, repo)
            .await
            .ok_or_else(|| CommentError::CredentialUnavailable {
                repo: format!("{}/{}", owner, repo),
            })
    }

    pub async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<CommentRef, CommentError> {
        let token = self.token(owner, repo).await?;
        self.post_with(&token, owner, repo, pr_number, body).await
    }

    pub async fn find_existing_comment(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        author_login: &str,
    ) -> Result<Option<CommentRef>, CommentError> {
        let token = self.token(owner, repo).await?;
        self.find_with(&token, owner, repo, pr_number, author_login)
            .await
    }

    pub async fn update_comment(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<CommentRef, CommentError> {
        let token = self.token(owner, repo).await?;
        self.update_with(&token, owner, repo, comment_id, body)
            .await
    }

    /// Update the bot's comment if one exists on the PR, otherwise post one.
    pub async fn upsert_comment(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<CommentRef, CommentError> {
        let token = self.token(owner, repo).await?;
        match self
            .find_with(&token, owner, repo, pr_number, &self.bot_login)
            .await?
        {
            Some(existing) => {
                self.update_with(&token, owner, repo, existing.id, body)
                    .await
            }
            None => self.post_with(&token, owner, repo, pr_number, body).await,
        }
    }

    async fn post_with(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<CommentRef, CommentError> {
        let comment = self
            .api
            .create_comment(token, owner, repo, pr_number, body)
            .await
            .map_err(CommentError::PostFailed)?;
        info!(repo = %format!("{}/{}", owner, repo), pr_number, comment_id = comment.id, "posted comment");
        Ok(comment)
    }

    async fn find_with(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
        author_login: &str,
    ) -> Result<Option<CommentRef>, CommentError> {
        let comments = self
            .api
            .list_comments(token, owner, repo, pr_number)
            .await
            .map_err(CommentError::PostFailed)?;

        let mut matches: Vec<&IssueComment> = comments
            .iter()
            .filter(|c| c.author() == Some(author_login))
            .collect();
        if matches.len() > 1 {
            warn!(pr_number, count = matches.len(), "multiple bot comments found; using the newest");
        }
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let newest = matches.last().map(|c| c.to_ref());
        debug!(pr_number, found = newest.is_some(), "looked up existing comment");
        Ok(newest)
    }

    async fn update_with(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<CommentRef, CommentError> {
        let comment = self
            .api
            .update_comment(token, owner, repo, comment_id, body)
            .await
            .map_err(CommentError::PostFailed)?;
        info!(repo = %format!("{}/{}", owner, repo), comment_id, "updated comment");
        Ok(comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::testing::{FakeCommentApi, FakeCredentials};
    use httpmock::prelude::*;
    use serde_json::json;

    const BOT: &str = "pr-preview[bot]";

    fn synchronizer(
        api: Arc<FakeCommentApi>,
        credentials: Arc<FakeCredentials>,
    ) -> CommentSynchronizer {
        CommentSynchronizer::new(api, credentials, BOT)
    }

    // ── is_valid_github_token ────────────────────────────────────────

    #[test]
    fn test_valid_token_prefixes() {
        assert!(is_valid_github_token("ghp_abc123def456"));
        assert!(is_valid_github_token("github_pat_abc123def456"));
        assert!(is_valid_github_token("ghs_xyz789"));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(!is_valid_github_token(""));
        assert!(!is_valid_github_token("not-a-token"));
        assert!(!is_valid_github_token("GHP_abc123"));
        assert!(!is_valid_github_token(" ghp_abc123"));
    }

    // ── Comment bodies ───────────────────────────────────────────────

    #[test]
    fn test_preview_comment_contains_url_and_marker() {
        let body = render_preview_comment("https://3000-sbx.preview", "ws-1");
        assert!(body.starts_with(COMMENT_MARKER));
        assert!(body.contains("https://3000-sbx.preview"));
        assert!(body.contains("ws-1"));
    }

    #[test]
    fn test_cleanup_comment_names_workspace() {
        let body = render_cleanup_comment("ws-1");
        assert!(body.starts_with(COMMENT_MARKER));
        assert!(body.contains("ws-1"));
        assert!(body.contains("removed"));
    }

    // ── Credentials ──────────────────────────────────────────────────

    fn installation(repo: &str, suspended: bool) -> Installation {
        Installation {
            repo: repo.to_string(),
            installation_id: 99,
            token: Some(format!("ghs_{}", repo.len())),
            suspended,
        }
    }

    #[tokio::test]
    async fn test_directory_without_preissued_token_yields_none() {
        let mut inst = installation("acme/site", false);
        inst.token = None;
        let dir = InstallationDirectory::new([inst]);
        assert!(dir.usable("acme", "site").is_some());
        assert!(dir.token_for("acme", "site").await.is_none());
    }

    #[tokio::test]
    async fn test_directory_returns_token_for_known_repo() {
        let dir = InstallationDirectory::new([installation("Acme/Site", false)]);
        assert_eq!(dir.token_for("acme", "site").await.as_deref(), Some("ghs_9"));
        assert!(dir.token_for("acme", "other").await.is_none());
    }

    #[tokio::test]
    async fn test_directory_withholds_suspended_installation() {
        let dir = InstallationDirectory::new([installation("acme/site", true)]);
        assert!(dir.lookup("acme", "site").is_some());
        assert!(dir.token_for("acme", "site").await.is_none());
    }

    #[tokio::test]
    async fn test_chained_provider_falls_back() {
        let dir: Arc<dyn CredentialProvider> =
            Arc::new(InstallationDirectory::new([installation("acme/site", true)]));
        let fallback: Arc<dyn CredentialProvider> = Arc::new(StaticTokenProvider::new("ghp_static"));
        let chained = ChainedProvider::new(vec![dir, fallback]);
        assert_eq!(chained.token_for("acme", "site").await.as_deref(), Some("ghp_static"));

        let empty = ChainedProvider::new(vec![]);
        assert!(empty.token_for("acme", "site").await.is_none());
    }

    // ── Synchronizer ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_post_comment_requires_credential() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        let sync = synchronizer(api.clone(), Arc::new(FakeCredentials::allowing(&[])));

        let err = sync.post_comment("acme", "site", 42, "hi").await.unwrap_err();
        assert!(matches!(err, CommentError::CredentialUnavailable { ref repo } if repo == "acme/site"));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_post_comment_failure_is_post_failed() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        api.fail_writes(true);
        let sync = synchronizer(api, Arc::new(FakeCredentials::allowing(&["acme/site"])));

        let err = sync.post_comment("acme", "site", 42, "hi").await.unwrap_err();
        assert!(matches!(err, CommentError::PostFailed(_)));
    }

    #[tokio::test]
    async fn test_find_existing_returns_newest_bot_comment() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        api.seed("acme", "site", 42, "alice", "looks good");
        api.seed("acme", "site", 42, BOT, "old preview");
        let newest = api.seed("acme", "site", 42, BOT, "newer preview");
        api.seed("acme", "site", 43, BOT, "other PR");
        let sync = synchronizer(api, Arc::new(FakeCredentials::allowing(&["acme/site"])));

        let found = sync
            .find_existing_comment("acme", "site", 42, BOT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newest);
    }

    #[tokio::test]
    async fn test_find_existing_ignores_other_authors() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        api.seed("acme", "site", 42, "alice", "hello");
        let sync = synchronizer(api, Arc::new(FakeCredentials::allowing(&["acme/site"])));

        assert!(sync
            .find_existing_comment("acme", "site", 42, BOT)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_posts_then_updates() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        let creds = Arc::new(FakeCredentials::allowing(&["acme/site"]));
        let sync = synchronizer(api.clone(), creds.clone());

        let first = sync.upsert_comment("acme", "site", 42, "v1").await.unwrap();
        let second = sync.upsert_comment("acme", "site", 42, "v2").await.unwrap();
        assert_eq!(first.id, second.id);

        let comments = api.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].body, "v2");
        assert_eq!(api.updates(), 1);
        // One credential resolution per logical operation
        assert_eq!(creds.resolutions(), 2);
    }

    #[tokio::test]
    async fn test_update_comment_edits_in_place() {
        let api = Arc::new(FakeCommentApi::new(BOT));
        let id = api.seed("acme", "site", 42, BOT, "before");
        let sync = synchronizer(api.clone(), Arc::new(FakeCredentials::allowing(&["acme/site"])));

        let updated = sync.update_comment("acme", "site", id, "after").await.unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(api.comments()[0].body, "after");
    }

    // ── GitHubClient ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_client_create_comment() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/acme/site/issues/42/comments")
                    .json_body(json!({"body": "hello"}));
                then.status(201).json_body(json!({
                    "id": 1001,
                    "html_url": "https://github.com/acme/site/pull/42#issuecomment-1001"
                }));
            })
            .await;

        let client = GitHubClient::new(&server.base_url());
        let comment = client
            .create_comment("ghs_abc", "acme", "site", 42, "hello")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(comment.id, 1001);
        assert!(comment.html_url.ends_with("issuecomment-1001"));
    }

    #[tokio::test]
    async fn test_client_list_comments_parses_users() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/acme/site/issues/42/comments")
                    .query_param("page", "1");
                then.status(200).json_body(json!([
                    {
                        "id": 1,
                        "body": "first",
                        "user": {"login": "alice"},
                        "html_url": "https://github.com/acme/site/pull/42#issuecomment-1",
                        "created_at": "2025-01-01T00:00:00Z"
                    },
                    {
                        "id": 2,
                        "body": "ghost",
                        "user": null,
                        "html_url": "https://github.com/acme/site/pull/42#issuecomment-2",
                        "created_at": "2025-01-02T00:00:00Z"
                    }
                ]));
            })
            .await;

        let client = GitHubClient::new(&server.base_url());
        let comments = client.list_comments("ghs_abc", "acme", "site", 42).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author(), Some("alice"));
        assert_eq!(comments[1].author(), None);
    }

    #[tokio::test]
    async fn test_client_update_error_status_is_err() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/repos/acme/site/issues/comments/7");
                then.status(404);
            })
            .await;

        let client = GitHubClient::new(&server.base_url());
        assert!(client
            .update_comment("ghs_abc", "acme", "site", 7, "x")
            .await
            .is_err());
    }

    // ── GitHubAppTokenProvider ───────────────────────────────────────

    const APP_KEY: &str = include_str!("../../tests/fixtures/github_app_key.pem");
    const APP_PUBLIC_KEY: &str = include_str!("../../tests/fixtures/github_app_key.pub.pem");

    fn app_provider(server: &MockServer, installations: Vec<Installation>) -> GitHubAppTokenProvider {
        GitHubAppTokenProvider::new(
            GitHubAppCredentials {
                app_id: "4242".into(),
                private_key: APP_KEY.into(),
            },
            InstallationDirectory::new(installations),
            &server.base_url(),
        )
    }

    fn app_installation(repo: &str, suspended: bool) -> Installation {
        Installation {
            repo: repo.to_string(),
            installation_id: 77,
            token: None,
            suspended,
        }
    }

    #[test]
    fn test_app_jwt_is_rs256_signed_for_app() {
        let provider = GitHubAppTokenProvider::new(
            GitHubAppCredentials {
                app_id: "4242".into(),
                private_key: APP_KEY.into(),
            },
            InstallationDirectory::default(),
            "http://localhost",
        );
        let now = Utc::now().timestamp();
        let jwt = provider.app_jwt(now).unwrap();

        let key = jsonwebtoken::DecodingKey::from_rsa_pem(APP_PUBLIC_KEY.as_bytes()).unwrap();
        let decoded = jsonwebtoken::decode::<AppClaims>(
            &jwt,
            &key,
            &jsonwebtoken::Validation::new(Algorithm::RS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, "4242");
        assert_eq!(decoded.claims.iat, now - 60);
        assert_eq!(decoded.claims.exp, now + 600);
    }

    #[test]
    fn test_app_jwt_rejects_garbage_key() {
        let provider = GitHubAppTokenProvider::new(
            GitHubAppCredentials {
                app_id: "4242".into(),
                private_key: "not a key".into(),
            },
            InstallationDirectory::default(),
            "http://localhost",
        );
        assert!(provider.app_jwt(Utc::now().timestamp()).is_err());
    }

    #[test]
    fn test_app_credentials_debug_hides_key() {
        let creds = GitHubAppCredentials {
            app_id: "4242".into(),
            private_key: APP_KEY.into(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("4242"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn test_app_provider_mints_token_per_call() {
        let server = MockServer::start_async().await;
        let mint = server
            .mock_async(|when, then| {
                when.method(POST).path("/app/installations/77/access_tokens");
                then.status(201).json_body(json!({
                    "token": "ghs_minted",
                    "expires_at": "2030-01-01T00:00:00Z"
                }));
            })
            .await;

        let provider = app_provider(&server, vec![app_installation("acme/site", false)]);
        assert_eq!(provider.token_for("acme", "site").await.as_deref(), Some("ghs_minted"));
        assert_eq!(provider.token_for("Acme", "Site").await.as_deref(), Some("ghs_minted"));
        mint.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn test_app_provider_refuses_suspended_and_unknown_repos() {
        let server = MockServer::start_async().await;
        let mint = server
            .mock_async(|_when, then| {
                then.status(201).json_body(json!({"token": "ghs_minted"}));
            })
            .await;

        let provider = app_provider(&server, vec![app_installation("acme/site", true)]);
        assert!(provider.token_for("acme", "site").await.is_none());
        assert!(provider.token_for("acme", "other").await.is_none());
        mint.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn test_app_provider_mint_failure_falls_through_chain() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/app/installations/77/access_tokens");
                then.status(401);
            })
            .await;

        let app: Arc<dyn CredentialProvider> =
            Arc::new(app_provider(&server, vec![app_installation("acme/site", false)]));
        assert!(app.token_for("acme", "site").await.is_none());

        let chained = ChainedProvider::new(vec![app, Arc::new(StaticTokenProvider::new("ghp_static"))]);
        assert_eq!(chained.token_for("acme", "site").await.as_deref(), Some("ghp_static"));
    }
}
