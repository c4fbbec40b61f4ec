use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::events::{PullRequestContext, PullRequestEvent, RepoRef};
use super::github::{CommentSynchronizer, render_cleanup_comment, render_preview_comment};
use super::models::{CommentRef, PollPolicy, Workspace};
use super::registry::WorkspaceRegistry;
use super::sandbox::SandboxDriver;
use crate::errors::{LifecycleError, RegistryError, SandboxError};

/// What handling one event did.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleOutcome {
    /// A fresh workspace became ready and the preview comment was written.
    Provisioned {
        workspace: Workspace,
        comment: CommentRef,
    },
    /// An active workspace was swapped for one on the new head.
    Replaced {
        previous_id: String,
        workspace: Workspace,
        comment: CommentRef,
    },
    /// Redelivery for a PR that already has an active workspace.
    AlreadyActive { workspace_id: String },
    TornDown {
        workspace_id: String,
        comment: CommentRef,
    },
    NothingToTearDown,
    Ignored { action: String },
}

type PrKey = (String, u64);

/// Per-PR async locks so that work for one PR never interleaves.
#[derive(Default)]
struct PrLocks {
    locks: Mutex<HashMap<PrKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PrLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<PrKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(&self, key: &PrKey) -> OwnedMutexGuard<()> {
        let lock = self.map().entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the guard and forget the entry once nobody else is waiting on it.
    fn release(&self, key: &PrKey, guard: OwnedMutexGuard<()>) {
        let mut map = self.map();
        drop(guard);
        if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Decides, per pull-request event, whether to create, replace or tear down
/// the PR's workspace, and keeps the PR comment in step.
///
/// PR state is never stored here; it is read from the registry on every
/// event.
pub struct LifecycleController {
    registry: Arc<WorkspaceRegistry>,
    driver: SandboxDriver,
    comments: CommentSynchronizer,
    poll: PollPolicy,
    locks: PrLocks,
    cancel: CancellationToken,
}

impl LifecycleController {
    pub fn new(driver: SandboxDriver, comments: CommentSynchronizer) -> Self {
        Self {
            registry: driver.registry().clone(),
            driver,
            comments,
            poll: PollPolicy::default(),
            locks: PrLocks::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Token that aborts pending readiness waits when cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &SandboxDriver {
        &self.driver
    }

    pub async fn handle_event(
        &self,
        event: PullRequestEvent,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let Some((repo, pr_number)) = event.key() else {
            info!(action = event.action(), "ignoring pull request action");
            return Ok(LifecycleOutcome::Ignored {
                action: event.action().to_string(),
            });
        };

        let key = (repo.to_string(), pr_number);
        let guard = self.locks.acquire(&key).await;
        let result = self.dispatch(event).await;
        self.locks.release(&key, guard);

        if let Err(e) = &result {
            error!(repo = %key.0, pr_number, "pull request event failed: {}", e);
        }
        result
    }

    async fn dispatch(&self, event: PullRequestEvent) -> Result<LifecycleOutcome, LifecycleError> {
        match event {
            PullRequestEvent::Opened(ctx) | PullRequestEvent::Reopened(ctx) => {
                self.on_opened(&ctx).await
            }
            PullRequestEvent::Synchronize(ctx) => self.on_synchronize(&ctx).await,
            PullRequestEvent::Closed { repo, pr_number } => self.on_closed(&repo, pr_number).await,
            PullRequestEvent::Other { action } => Ok(LifecycleOutcome::Ignored { action }),
        }
    }

    async fn on_opened(&self, ctx: &PullRequestContext) -> Result<LifecycleOutcome, LifecycleError> {
        if let Some(existing) = self.active_workspace(ctx).await {
            info!(
                repo = %ctx.repo.full_name,
                pr_number = ctx.pr_number,
                workspace_id = %existing.id,
                "workspace already exists"
            );
            return Ok(LifecycleOutcome::AlreadyActive {
                workspace_id: existing.id,
            });
        }

        let workspace = match self.provision(ctx).await {
            Err(LifecycleError::Sandbox(SandboxError::Registry(
                RegistryError::DuplicateActiveWorkspace { .. },
            ))) => return Ok(self.already_active(ctx)),
            other => other?,
        };
        let body = preview_body(&workspace);
        let comment = self
            .comments
            .post_comment(&ctx.repo.owner, &ctx.repo.name, ctx.pr_number, &body)
            .await?;
        Ok(LifecycleOutcome::Provisioned { workspace, comment })
    }

    async fn on_synchronize(
        &self,
        ctx: &PullRequestContext,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let previous = self.active_workspace(ctx).await;
        if let Some(old) = &previous {
            info!(
                repo = %ctx.repo.full_name,
                pr_number = ctx.pr_number,
                workspace_id = %old.id,
                "replacing workspace for new head"
            );
            if !self.driver.delete_workspace(&old.id).await {
                // Best effort: the sandbox may linger, but the PR must not stay wedged.
                warn!(workspace_id = %old.id, "dropping record of undeletable workspace");
                self.registry.delete(&old.id);
            }
        }

        let workspace = match self.provision(ctx).await {
            Err(LifecycleError::Sandbox(SandboxError::Registry(
                RegistryError::DuplicateActiveWorkspace { .. },
            ))) => return Ok(self.already_active(ctx)),
            other => other?,
        };
        let body = preview_body(&workspace);
        let comment = self
            .comments
            .upsert_comment(&ctx.repo.owner, &ctx.repo.name, ctx.pr_number, &body)
            .await?;

        Ok(match previous {
            Some(old) => LifecycleOutcome::Replaced {
                previous_id: old.id,
                workspace,
                comment,
            },
            None => LifecycleOutcome::Provisioned { workspace, comment },
        })
    }

    async fn on_closed(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let Some(workspace) = self.registry.get_by_pr(&repo.full_name, pr_number) else {
            info!(repo = %repo.full_name, pr_number, "no workspace to tear down");
            return Ok(LifecycleOutcome::NothingToTearDown);
        };
        if !workspace.is_active() {
            self.discard(&workspace).await;
            return Ok(LifecycleOutcome::NothingToTearDown);
        }

        if !self.driver.delete_workspace(&workspace.id).await {
            return Err(LifecycleError::TeardownFailed {
                workspace_id: workspace.id,
            });
        }

        let comment = self
            .comments
            .post_comment(
                &repo.owner,
                &repo.name,
                pr_number,
                &render_cleanup_comment(&workspace.id),
            )
            .await?;
        Ok(LifecycleOutcome::TornDown {
            workspace_id: workspace.id,
            comment,
        })
    }

    /// The PR's active workspace, if any. A failed record found on the way is
    /// cleaned up so it cannot block a fresh provision.
    async fn active_workspace(&self, ctx: &PullRequestContext) -> Option<Workspace> {
        let existing = self
            .registry
            .get_by_pr(&ctx.repo.full_name, ctx.pr_number)?;
        if existing.is_active() {
            return Some(existing);
        }
        self.discard(&existing).await;
        None
    }

    /// Best-effort removal of a failed workspace. The record goes whether or
    /// not the provider accepts the delete.
    async fn discard(&self, workspace: &Workspace) {
        warn!(workspace_id = %workspace.id, "discarding failed workspace");
        if !self.driver.delete_workspace(&workspace.id).await {
            self.registry.delete(&workspace.id);
        }
    }

    fn already_active(&self, ctx: &PullRequestContext) -> LifecycleOutcome {
        let workspace_id = self
            .registry
            .get_by_pr(&ctx.repo.full_name, ctx.pr_number)
            .map(|ws| ws.id)
            .unwrap_or_default();
        LifecycleOutcome::AlreadyActive { workspace_id }
    }

    /// Create a workspace and wait until it serves a preview.
    async fn provision(&self, ctx: &PullRequestContext) -> Result<Workspace, LifecycleError> {
        let workspace = self
            .driver
            .create_workspace(
                &ctx.clone_url,
                &ctx.branch,
                ctx.pr_number,
                &ctx.repo.full_name,
            )
            .await?;
        if workspace.is_ready() {
            return Ok(workspace);
        }

        match self
            .driver
            .wait_for_ready(&workspace.id, self.poll, &self.cancel)
            .await
        {
            Some(ready) => Ok(ready),
            None => {
                self.registry.mark_error(&workspace.id);
                Err(LifecycleError::ReadinessTimeout {
                    workspace_id: workspace.id,
                })
            }
        }
    }
}

fn preview_body(workspace: &Workspace) -> String {
    render_preview_comment(
        workspace.preview_url.as_deref().unwrap_or_default(),
        &workspace.id,
    )
}
