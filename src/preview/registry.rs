use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::models::{Workspace, WorkspaceStatus, WorkspaceUpdate};
use crate::errors::RegistryError;

type PrKey = (String, u64);

#[derive(Default)]
struct RegistryState {
    workspaces: HashMap<String, Workspace>,
    by_pr: HashMap<PrKey, String>,
}

impl RegistryState {
    fn remove(&mut self, id: &str) -> Option<Workspace> {
        let workspace = self.workspaces.remove(id)?;
        let key = (workspace.repo_full_name.clone(), workspace.pr_number);
        if self.by_pr.get(&key).is_some_and(|indexed| indexed == id) {
            self.by_pr.remove(&key);
        }
        Some(workspace)
    }
}

/// Keyed store of workspace records, indexed by identity and by (repo, PR).
///
/// Every operation runs under one mutex, so the primary map and the PR index
/// are never observed out of step and concurrent `create` calls for the same
/// PR cannot both succeed. Constructed once per process and shared via `Arc`.
#[derive(Default)]
pub struct WorkspaceRegistry {
    inner: Mutex<RegistryState>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-updated,
        // so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a fresh `creating` record for the PR.
    ///
    /// Fails if an active record already exists for the pair. A failed
    /// (`error`) record is evicted and replaced.
    pub fn create(
        &self,
        repo_full_name: &str,
        pr_number: u64,
        branch: &str,
    ) -> Result<Workspace, RegistryError> {
        let mut state = self.state();
        let key = (repo_full_name.to_string(), pr_number);

        if let Some(existing_id) = state.by_pr.get(&key).cloned() {
            match state.workspaces.get(&existing_id) {
                Some(existing) if existing.is_active() => {
                    return Err(RegistryError::DuplicateActiveWorkspace {
                        repo: repo_full_name.to_string(),
                        pr_number,
                    });
                }
                _ => {
                    debug!(workspace_id = %existing_id, "evicting failed workspace record");
                    state.remove(&existing_id);
                }
            }
        }

        let now = Utc::now();
        let workspace = Workspace {
            id: generate_workspace_id(repo_full_name, pr_number, now),
            repo_full_name: repo_full_name.to_string(),
            pr_number,
            branch: branch.to_string(),
            status: WorkspaceStatus::Creating,
            preview_url: None,
            sandbox_id: None,
            created_at: now,
            updated_at: now,
        };

        state.by_pr.insert(key, workspace.id.clone());
        state
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    pub fn get(&self, id: &str) -> Option<Workspace> {
        self.state().workspaces.get(id).cloned()
    }

    /// Look up the record bound to a PR, whatever its status.
    pub fn get_by_pr(&self, repo_full_name: &str, pr_number: u64) -> Option<Workspace> {
        let state = self.state();
        let id = state.by_pr.get(&(repo_full_name.to_string(), pr_number))?;
        state.workspaces.get(id).cloned()
    }

    pub fn update(&self, id: &str, update: WorkspaceUpdate) -> Option<Workspace> {
        let mut state = self.state();
        let workspace = state.workspaces.get_mut(id)?;

        if let Some(status) = update.status {
            workspace.status = status;
        }
        if let Some(preview_url) = update.preview_url {
            workspace.preview_url = Some(preview_url);
        }
        if let Some(sandbox_id) = update.sandbox_id {
            workspace.sandbox_id = Some(sandbox_id);
        }
        workspace.updated_at = Utc::now().max(workspace.updated_at);

        Some(workspace.clone())
    }

    pub fn mark_ready(&self, id: &str, preview_url: &str) -> Option<Workspace> {
        self.update(
            id,
            WorkspaceUpdate::status(WorkspaceStatus::Ready)
                .with_preview_url(Some(preview_url.to_string())),
        )
    }

    pub fn mark_error(&self, id: &str) -> Option<Workspace> {
        self.update(id, WorkspaceUpdate::status(WorkspaceStatus::Error))
    }

    /// Remove the record and its PR index entry.
    pub fn delete(&self, id: &str) -> bool {
        self.state().remove(id).is_some()
    }

    pub fn delete_by_pr(&self, repo_full_name: &str, pr_number: u64) -> bool {
        let mut state = self.state();
        match state.by_pr.get(&(repo_full_name.to_string(), pr_number)).cloned() {
            Some(id) => state.remove(&id).is_some(),
            None => false,
        }
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.state().workspaces.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn list_by_status(&self, status: WorkspaceStatus) -> Vec<Workspace> {
        self.list()
            .into_iter()
            .filter(|ws| ws.status == status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a workspace identity unique across repeated creations for one PR.
fn generate_workspace_id(repo_full_name: &str, pr_number: u64, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "pr-preview-{}-{}-{}-{}",
        repo_full_name.replace('/', "-"),
        pr_number,
        now.timestamp_millis(),
        &suffix[..8]
    )
}
