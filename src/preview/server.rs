use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState, SharedState};
use super::controller::LifecycleController;
use super::github::{
    ChainedProvider, CommentSynchronizer, CredentialProvider, GitHubAppTokenProvider, GitHubClient,
    InstallationDirectory, StaticTokenProvider,
};
use super::registry::WorkspaceRegistry;
use super::sandbox::{HttpSandboxApi, SandboxDriver};
use super::webhook::SignatureVerifier;
use crate::config::AppConfig;

/// Build the full application router with request tracing.
pub fn build_router(state: SharedState, webhook_path: &str) -> Router {
    api::api_router(webhook_path)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the registry, provider client, comment client and controller
/// described by `config`.
pub fn build_state(config: &AppConfig, cancel: CancellationToken) -> Result<SharedState> {
    let registry = Arc::new(WorkspaceRegistry::new());
    let sandbox_api = HttpSandboxApi::new(&config.sandbox)?;
    let driver = SandboxDriver::new(
        Arc::new(sandbox_api),
        registry,
        config.sandbox.template.clone(),
    );

    let comments = CommentSynchronizer::new(
        Arc::new(GitHubClient::new(&config.github_api_url)),
        Arc::new(credential_chain(config)),
        config.bot_login.clone(),
    );

    let controller = LifecycleController::new(driver, comments)
        .with_poll_policy(config.poll)
        .with_cancellation(cancel);

    Ok(Arc::new(AppState {
        controller: Arc::new(controller),
        verifier: SignatureVerifier::new(config.webhook_secret.clone()),
        tasks: TaskTracker::new(),
    }))
}

/// App-minted installation tokens first, then pre-issued installation
/// tokens, then the static token.
fn credential_chain(config: &AppConfig) -> ChainedProvider {
    let mut providers: Vec<Arc<dyn CredentialProvider>> = Vec::new();
    if !config.installations.is_empty() {
        let directory = InstallationDirectory::new(config.installations.iter().cloned());
        if let Some(app) = &config.github_app {
            providers.push(Arc::new(GitHubAppTokenProvider::new(
                app.clone(),
                directory.clone(),
                &config.github_api_url,
            )));
        }
        providers.push(Arc::new(directory));
    }
    if let Some(token) = &config.github_token {
        providers.push(Arc::new(StaticTokenProvider::new(token.clone())));
    }
    ChainedProvider::new(providers)
}

/// Start the webhook server and run until Ctrl+C.
pub async fn start_server(config: AppConfig) -> Result<()> {
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let cancel = CancellationToken::new();
    let state = build_state(&config, cancel.clone())?;
    let tasks = state.tasks.clone();
    let app = build_router(state, &config.webhook_path);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        "PR preview server listening on http://{} (webhook: {})",
        local_addr, config.webhook_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("Server error")?;

    tasks.close();
    if !tasks.is_empty() {
        info!(pending = tasks.len(), "waiting for in-flight pull request events");
    }
    tasks.wait().await;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down; cancelling pending readiness waits");
    cancel.cancel();
}
