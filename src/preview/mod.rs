//! PR previews: one disposable sandbox workspace per open pull request.
//!
//! ## Overview
//!
//! GitHub delivers pull-request webhooks; the lifecycle controller decides
//! whether the PR needs a workspace created, replaced or torn down, drives
//! the sandbox provider accordingly, and keeps a single bot comment on the
//! PR pointing at the live preview.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  webhook ┌──────────────────────────────────────────────────┐
//! │  GitHub  │ ───────> │  server.rs  (axum Router, TraceLayer, shutdown)  │
//! │          │          │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘          │         │ webhook.rs  (HMAC-SHA256 verify)       │
//!      ^                │         │ events.rs   (PullRequestEvent)         │
//!      │                │         v                                        │
//!      │                │  controller.rs  (LifecycleController, PrLocks)   │
//!      │                │     │                         │                  │
//!      │  comments      │     v                         v                  │
//!      └─────────────── │  github.rs               sandbox.rs              │
//!                       │  (CommentSynchronizer,   (SandboxDriver,         │
//!                       │   CredentialProvider)     SandboxApi)            │
//!                       │                               │                  │
//!                       │                               v                  │
//!                       │                  registry.rs (WorkspaceRegistry) │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | Shared types: `Workspace`, `WorkspaceStatus`, `PollPolicy` |
//! | `testing`  | In-process fakes for the provider, GitHub and credentials  |

pub mod api;
pub mod controller;
pub mod events;
pub mod github;
pub mod models;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
