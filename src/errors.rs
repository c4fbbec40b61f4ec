//! Typed error hierarchy for the preview orchestrator.
//!
//! One enum per subsystem:
//! - `RegistryError`: workspace bookkeeping precondition failures
//! - `SandboxError`: sandbox provisioning failures
//! - `CommentError`: review-comment posting failures
//! - `LifecycleError`: anything the lifecycle controller surfaces
//! - `WebhookError`: rejected inbound deliveries

use thiserror::Error;

/// Errors from the workspace registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("An active workspace already exists for {repo}#{pr_number}")]
    DuplicateActiveWorkspace { repo: String, pr_number: u64 },
}

/// Errors from the sandbox driver.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox for workspace {workspace_id}: {source}")]
    ProvisionFailed {
        workspace_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from the comment synchronizer.
#[derive(Debug, Error)]
pub enum CommentError {
    #[error("No usable installation credential for {repo}")]
    CredentialUnavailable { repo: String },

    #[error("Failed to post or update comment: {0}")]
    PostFailed(#[source] anyhow::Error),
}

/// Errors surfaced by the lifecycle controller to the event dispatch boundary.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Comment(#[from] CommentError),

    #[error("Workspace {workspace_id} never became ready")]
    ReadinessTimeout { workspace_id: String },

    #[error("Failed to tear down workspace {workspace_id}")]
    TeardownFailed { workspace_id: String },
}

/// Reasons an inbound webhook delivery is rejected.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}
