mod config;
mod lifecycle;

use config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(agent_id = %config.agent_id, orchestrator_url = %config.orchestrator_url, "starting transcast-agent");

    lifecycle::run(config).await
}
