//! Stdio entry point for the sequential-thinking MCP server.

pub mod server;

use thinking_engine::EngineConfig;

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let server = server::ThinkingMcpServer::new(config)
        .map_err(|e| anyhow::anyhow!("invalid engine configuration: {e}"))?;
    server.start_stdio().await
}
