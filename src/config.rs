//! Process configuration, read from the environment plus an optional TOML
//! file named by `PREVIEW_CONFIG`.
//!
//! ```toml
//! [poll]
//! max_attempts = 30
//! interval_ms = 5000
//!
//! [[installations]]
//! repo = "acme/site"
//! installation_id = 1234
//! # token = "ghs_..."   pre-issued; omit when GITHUB_APP_ID is set
//! suspended = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::preview::github::{GitHubAppCredentials, Installation, is_valid_github_token};
use crate::preview::models::PollPolicy;
use crate::preview::sandbox::SandboxConfig;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_WEBHOOK_PATH: &str = "/api/webhook";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_BOT_LOGIN: &str = "pr-preview[bot]";

/// Top-level structure of the optional TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct PreviewToml {
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub installations: Vec<Installation>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PollSection {
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
}

impl PreviewToml {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse preview config")
    }

    /// Missing file yields the defaults; unreadable or invalid files are errors.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

/// Resolved configuration for the whole process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub webhook_secret: String,
    pub sandbox: SandboxConfig,
    pub github_token: Option<String>,
    pub github_app: Option<GitHubAppCredentials>,
    pub github_api_url: String,
    pub bot_login: String,
    pub port: u16,
    pub webhook_path: String,
    pub poll: PollPolicy,
    pub installations: Vec<Installation>,
    pub config_file: Option<PathBuf>,
    pub json_logs: bool,
}

impl AppConfig {
    /// Load from the process environment. `main` has already applied `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup. All problems are collected
    /// and reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut errors = Vec::new();

        let webhook_secret = var("GITHUB_WEBHOOK_SECRET").unwrap_or_else(|| {
            errors.push("GITHUB_WEBHOOK_SECRET is required".to_string());
            String::new()
        });
        let api_key = var("DAYTONA_API_KEY").unwrap_or_else(|| {
            errors.push("DAYTONA_API_KEY is required".to_string());
            String::new()
        });

        let port = match var("PORT") {
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                errors.push(format!("PORT must be a port number, got '{}'", raw));
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };

        let webhook_path = var("WEBHOOK_PATH").unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string());
        if !webhook_path.starts_with('/') {
            errors.push(format!("WEBHOOK_PATH must start with '/', got '{}'", webhook_path));
        }

        let github_token = var("GITHUB_TOKEN");
        if let Some(token) = &github_token
            && !is_valid_github_token(token)
        {
            errors.push("GITHUB_TOKEN does not look like a GitHub token".to_string());
        }

        let github_app = match (var("GITHUB_APP_ID"), var("GITHUB_PRIVATE_KEY")) {
            (Some(app_id), Some(private_key)) => {
                if app_id.parse::<u64>().is_err() {
                    errors.push(format!("GITHUB_APP_ID must be numeric, got '{}'", app_id));
                }
                Some(GitHubAppCredentials {
                    app_id,
                    // Single-line env files carry the PEM with escaped newlines
                    private_key: private_key.replace("\\n", "\n"),
                })
            }
            (None, None) => None,
            _ => {
                errors.push("GITHUB_APP_ID and GITHUB_PRIVATE_KEY must be set together".to_string());
                None
            }
        };

        let config_file = var("PREVIEW_CONFIG").map(PathBuf::from);
        let file = match &config_file {
            Some(path) => match PreviewToml::load_or_default(path) {
                Ok(file) => file,
                Err(e) => {
                    errors.push(format!("{:#}", e));
                    PreviewToml::default()
                }
            },
            None => PreviewToml::default(),
        };

        // Environment wins over the file, the file over the defaults.
        let mut poll = PollPolicy::default();
        if let Some(max_attempts) = file.poll.max_attempts {
            poll.max_attempts = max_attempts;
        }
        if let Some(interval_ms) = file.poll.interval_ms {
            poll.interval_ms = interval_ms;
        }
        if let Some(raw) = var("PREVIEW_POLL_ATTEMPTS") {
            match raw.parse() {
                Ok(n) => poll.max_attempts = n,
                Err(_) => errors.push(format!("PREVIEW_POLL_ATTEMPTS must be a number, got '{}'", raw)),
            }
        }
        if let Some(raw) = var("PREVIEW_POLL_INTERVAL_MS") {
            match raw.parse() {
                Ok(n) => poll.interval_ms = n,
                Err(_) => errors.push(format!("PREVIEW_POLL_INTERVAL_MS must be a number, got '{}'", raw)),
            }
        }
        if poll.max_attempts == 0 {
            errors.push("poll max_attempts must be at least 1".to_string());
        }

        for inst in &file.installations {
            if !inst.repo.contains('/') {
                errors.push(format!("installation repo '{}' must be owner/name", inst.repo));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
        }

        let sandbox_defaults = SandboxConfig::default();
        Ok(Self {
            webhook_secret,
            sandbox: SandboxConfig {
                api_url: var("DAYTONA_API_URL").unwrap_or(sandbox_defaults.api_url),
                api_key,
                template: var("DAYTONA_WORKSPACE_TEMPLATE"),
                request_timeout: sandbox_defaults.request_timeout,
            },
            github_token,
            github_app,
            github_api_url: var("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            bot_login: var("GITHUB_BOT_LOGIN").unwrap_or_else(|| DEFAULT_BOT_LOGIN.to_string()),
            port,
            webhook_path,
            poll,
            installations: file.installations,
            config_file,
            json_logs: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Non-fatal problems worth reporting at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.github_token.is_none() && self.installations.is_empty() {
            warnings.push(
                "No GITHUB_TOKEN and no installations configured; PR comments will fail".to_string(),
            );
        }
        if self.github_app.is_some() && self.installations.is_empty() {
            warnings.push(
                "GitHub App configured but no installations listed; it cannot resolve any repository"
                    .to_string(),
            );
        }
        if self.github_app.is_none() {
            let tokenless = self
                .installations
                .iter()
                .filter(|i| i.token.is_none())
                .count();
            if tokenless > 0 {
                warnings.push(format!(
                    "{} installation(s) have no token and no GitHub App is configured",
                    tokenless
                ));
            }
        }
        let suspended = self.installations.iter().filter(|i| i.suspended).count();
        if suspended > 0 {
            warnings.push(format!("{} installation(s) are suspended", suspended));
        }
        warnings
    }

    /// Human-readable summary with secrets masked.
    pub fn redacted_summary(&self) -> String {
        let mut lines = vec![
            format!("port:             {}", self.port),
            format!("webhook path:     {}", self.webhook_path),
            format!("webhook secret:   {}", mask(&self.webhook_secret)),
            format!("sandbox api:      {}", self.sandbox.api_url),
            format!("sandbox api key:  {}", mask(&self.sandbox.api_key)),
            format!(
                "sandbox template: {}",
                self.sandbox.template.as_deref().unwrap_or("(provider default)")
            ),
            format!("github api:       {}", self.github_api_url),
            format!(
                "github token:     {}",
                self.github_token.as_deref().map(mask).unwrap_or_else(|| "(none)".into())
            ),
            format!(
                "github app:       {}",
                self.github_app.as_ref().map_or("(none)", |app| app.app_id.as_str())
            ),
            format!("bot login:        {}", self.bot_login),
            format!(
                "readiness poll:   {} x {}ms",
                self.poll.max_attempts, self.poll.interval_ms
            ),
            format!("installations:    {}", self.installations.len()),
        ];
        if let Some(path) = &self.config_file {
            lines.push(format!("config file:      {}", path.display()));
        }
        lines.join("\n")
    }
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}
