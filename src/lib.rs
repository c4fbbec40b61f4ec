pub mod config;
pub mod errors;
pub mod preview;

pub use config::AppConfig;
pub use errors::{CommentError, LifecycleError, RegistryError, SandboxError, WebhookError};
pub use preview::controller::{LifecycleController, LifecycleOutcome};
pub use preview::events::PullRequestEvent;
pub use preview::models::{PollPolicy, Workspace, WorkspaceStatus};
pub use preview::registry::WorkspaceRegistry;
