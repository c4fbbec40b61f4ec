use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a preview workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Ready,
    Error,
    Stopped,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Map a status string reported by the sandbox provider. Anything the
    /// provider reports outside the known set is treated as a failure.
    pub fn from_provider(raw: &str) -> Self {
        raw.trim()
            .to_ascii_lowercase()
            .parse()
            .unwrap_or(Self::Error)
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid workspace status: {}", s)),
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ephemeral sandbox bound to a single pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: String,
    pub repo_full_name: String,
    pub pr_number: u64,
    pub branch: String,
    pub status: WorkspaceStatus,
    pub preview_url: Option<String>,
    /// Identifier assigned by the sandbox provider, once known.
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// A workspace counts as active until it fails or is deleted.
    pub fn is_active(&self) -> bool {
        self.status != WorkspaceStatus::Error
    }

    /// Identifier to address the sandbox with on the provider side.
    pub fn remote_id(&self) -> &str {
        self.sandbox_id.as_deref().unwrap_or(&self.id)
    }

    pub fn is_ready(&self) -> bool {
        self.status == WorkspaceStatus::Ready && self.preview_url.is_some()
    }
}

/// Mutable subset of a workspace record. Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceUpdate {
    pub status: Option<WorkspaceStatus>,
    pub preview_url: Option<String>,
    pub sandbox_id: Option<String>,
}

impl WorkspaceUpdate {
    pub fn status(status: WorkspaceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_preview_url(mut self, preview_url: Option<String>) -> Self {
        self.preview_url = preview_url;
        self
    }

    pub fn with_sandbox_id(mut self, sandbox_id: Option<String>) -> Self {
        self.sandbox_id = sandbox_id;
        self
    }
}

/// Reference to a remote review comment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRef {
    pub id: u64,
    pub html_url: String,
}

/// Bounded polling policy used while waiting for a workspace to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 5000,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }
}
