use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{PollPolicy, Workspace, WorkspaceStatus, WorkspaceUpdate};
use super::registry::WorkspaceRegistry;
use crate::errors::SandboxError;

/// Connection settings for the remote sandbox provider.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub api_url: String,
    pub api_key: String,
    pub template: Option<String>,
    pub request_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.daytona.io".to_string(),
            api_key: String::new(),
            template: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Body of a sandbox creation request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub repo_url: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub env_vars: HashMap<String, String>,
}

/// What the provider reports about a sandbox.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub status: String,
}

/// Abstraction over the sandbox provider for testability.
/// Real implementation: `HttpSandboxApi`.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxInfo>;
    async fn status(&self, sandbox_id: &str) -> Result<SandboxInfo>;
    async fn delete(&self, sandbox_id: &str) -> Result<()>;
    async fn stop(&self, sandbox_id: &str) -> Result<()>;
    async fn start(&self, sandbox_id: &str) -> Result<()>;
}

/// REST client for the sandbox provider.
pub struct HttpSandboxApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSandboxApi {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build sandbox HTTP client")?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_action(&self, sandbox_id: &str, action: &str) -> Result<()> {
        self.client
            .post(self.url(&format!("/workspaces/{}/{}", sandbox_id, action)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to sandbox provider", action))?
            .error_for_status()
            .with_context(|| format!("Sandbox provider rejected {} request", action))?;
        Ok(())
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxInfo> {
        self.client
            .post(self.url("/workspaces"))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .context("Failed to send create request to sandbox provider")?
            .error_for_status()
            .context("Sandbox provider returned error status on create")?
            .json::<SandboxInfo>()
            .await
            .context("Failed to parse sandbox create response")
    }

    async fn status(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        self.client
            .get(self.url(&format!("/workspaces/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Failed to send status request to sandbox provider")?
            .error_for_status()
            .context("Sandbox provider returned error status on status lookup")?
            .json::<SandboxInfo>()
            .await
            .context("Failed to parse sandbox status response")
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        self.client
            .delete(self.url(&format!("/workspaces/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Failed to send delete request to sandbox provider")?
            .error_for_status()
            .context("Sandbox provider rejected delete request")?;
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<()> {
        self.post_action(sandbox_id, "stop").await
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        self.post_action(sandbox_id, "start").await
    }
}

/// Drives the sandbox provider and mirrors every observed change into the
/// registry. Holds workspace ids only; records are re-read on every call.
pub struct SandboxDriver {
    api: Arc<dyn SandboxApi>,
    registry: Arc<WorkspaceRegistry>,
    template: Option<String>,
}

impl SandboxDriver {
    pub fn new(
        api: Arc<dyn SandboxApi>,
        registry: Arc<WorkspaceRegistry>,
        template: Option<String>,
    ) -> Self {
        Self {
            api,
            registry,
            template,
        }
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Allocate a registry record and provision the remote sandbox for it.
    ///
    /// On provider failure the record is kept with status `error` so the
    /// failure stays observable.
    pub async fn create_workspace(
        &self,
        repo_url: &str,
        branch: &str,
        pr_number: u64,
        repo_full_name: &str,
    ) -> Result<Workspace, SandboxError> {
        let workspace = self.registry.create(repo_full_name, pr_number, branch)?;

        let request = CreateSandboxRequest {
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            template: self.template.clone(),
            env_vars: HashMap::from([
                ("PR_NUMBER".to_string(), pr_number.to_string()),
                ("REPO_FULL_NAME".to_string(), repo_full_name.to_string()),
                ("BRANCH".to_string(), branch.to_string()),
            ]),
        };

        let info = match self.api.create(&request).await {
            Ok(info) => info,
            Err(e) => {
                error!(workspace_id = %workspace.id, "failed to create sandbox: {:#}", e);
                self.registry.mark_error(&workspace.id);
                return Err(SandboxError::ProvisionFailed {
                    workspace_id: workspace.id,
                    source: e,
                });
            }
        };

        let reported = WorkspaceStatus::from_provider(&info.status);
        if info.preview_url.is_none() && reported == WorkspaceStatus::Error {
            self.registry.update(
                &workspace.id,
                WorkspaceUpdate::status(WorkspaceStatus::Error).with_sandbox_id(info.id),
            );
            return Err(SandboxError::ProvisionFailed {
                workspace_id: workspace.id,
                source: anyhow::anyhow!("provider reported status '{}'", info.status),
            });
        }

        let status = if info.preview_url.is_some() {
            WorkspaceStatus::Ready
        } else {
            WorkspaceStatus::Running
        };
        info!(
            workspace_id = %workspace.id,
            preview_url = info.preview_url.as_deref().unwrap_or("pending"),
            "workspace created"
        );

        let updated = self.registry.update(
            &workspace.id,
            WorkspaceUpdate::status(status)
                .with_preview_url(info.preview_url)
                .with_sandbox_id(info.id),
        );
        // The record can only vanish if someone deleted it concurrently.
        Ok(updated.unwrap_or(workspace))
    }

    /// Refresh a workspace from the provider. Returns `None` when the id is
    /// unknown or the provider lookup fails; the latter is a soft failure.
    pub async fn get_status(&self, id: &str) -> Option<Workspace> {
        let workspace = self.registry.get(id)?;
        match self.api.status(workspace.remote_id()).await {
            Ok(info) => self.registry.update(
                id,
                WorkspaceUpdate::status(WorkspaceStatus::from_provider(&info.status))
                    .with_preview_url(info.preview_url),
            ),
            Err(e) => {
                warn!(workspace_id = %id, "failed to get workspace status: {:#}", e);
                None
            }
        }
    }

    /// Delete the remote sandbox, then the registry record. The record is
    /// left in place when the remote call fails so the delete can be retried.
    pub async fn delete_workspace(&self, id: &str) -> bool {
        let Some(workspace) = self.registry.get(id) else {
            return false;
        };
        match self.api.delete(workspace.remote_id()).await {
            Ok(()) => {
                self.registry.delete(id);
                info!(workspace_id = %id, "workspace deleted");
                true
            }
            Err(e) => {
                error!(workspace_id = %id, "failed to delete workspace: {:#}", e);
                false
            }
        }
    }

    /// Poll until the workspace is ready with a preview URL.
    ///
    /// Returns `None` as soon as the workspace reports `error`, once
    /// `policy.max_attempts` polls are used up, or when `cancel` fires.
    pub async fn wait_for_ready(
        &self,
        id: &str,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Option<Workspace> {
        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                info!(workspace_id = %id, "readiness wait cancelled");
                return None;
            }

            if let Some(workspace) = self.get_status(id).await {
                if workspace.is_ready() {
                    return Some(workspace);
                }
                if workspace.status == WorkspaceStatus::Error {
                    error!(workspace_id = %id, "workspace reported error");
                    return None;
                }
            }

            if attempt == policy.max_attempts {
                break;
            }
            debug!(
                workspace_id = %id,
                attempt,
                max_attempts = policy.max_attempts,
                "waiting for workspace to become ready"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(workspace_id = %id, "readiness wait cancelled");
                    return None;
                }
                _ = tokio::time::sleep(policy.interval()) => {}
            }
        }

        error!(workspace_id = %id, "timed out waiting for workspace to become ready");
        None
    }

    /// Pause a workspace. Failures are logged and reported as `false`.
    pub async fn stop_workspace(&self, id: &str) -> bool {
        self.remote_transition(id, WorkspaceStatus::Stopped).await
    }

    /// Resume a stopped workspace. Failures are logged and reported as `false`.
    pub async fn start_workspace(&self, id: &str) -> bool {
        self.remote_transition(id, WorkspaceStatus::Running).await
    }

    async fn remote_transition(&self, id: &str, target: WorkspaceStatus) -> bool {
        let Some(workspace) = self.registry.get(id) else {
            return false;
        };
        let result = match target {
            WorkspaceStatus::Stopped => self.api.stop(workspace.remote_id()).await,
            _ => self.api.start(workspace.remote_id()).await,
        };
        match result {
            Ok(()) => {
                self.registry.update(id, WorkspaceUpdate::status(target));
                info!(workspace_id = %id, status = %target, "workspace transitioned");
                true
            }
            Err(e) => {
                warn!(workspace_id = %id, status = %target, "workspace transition failed: {:#}", e);
                false
            }
        }
    }
}
