//! Webhook server command: `pr-preview serve`.

use anyhow::Result;

use pr_preview::config::AppConfig;

pub async fn cmd_serve(mut config: AppConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    pr_preview::preview::server::start_server(config).await
}
