use std::net::SocketAddr;
use std::sync::Arc;

use bloombuddy_engine::server::{serve, AppState};
use bloombuddy_engine::{
    init_tracing, open_store, AppConfig, BloomError, ChatSession, DocumentAnalyzer, LlmGateway,
    LogFormat, MemoryManager, PredictionClient, Result, TelemetryCollector,
};
use tracing::info;

/// Usage: `health-companion [config.toml]`. `BLOOM_*` variables override the file.
#[tokio::main]
async fn main() -> Result<()> {
    let format = std::env::var("BLOOM_LOG_FORMAT")
        .ok()
        .map(|raw| raw.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();
    init_tracing(format)?;

    let cfg = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_env_or_file(path)?,
        None => AppConfig::from_env()?,
    };

    let telemetry = TelemetryCollector::default();
    let gateway = Arc::new(LlmGateway::from_config(&cfg.model)?.with_telemetry(telemetry.clone()));
    let store = open_store(&cfg.storage).await?;
    let memory = MemoryManager::load(store, cfg.memory.options()).await;
    let session = ChatSession::start(memory, gateway.clone()).await?;

    let analyzer = DocumentAnalyzer::from_config(gateway.clone(), &cfg.analyzer)
        .with_telemetry(telemetry.clone());
    let predictions = PredictionClient::from_config(&cfg.prediction)?
        .with_gateway(gateway.clone())
        .with_telemetry(telemetry);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|err| BloomError::Config(format!("invalid listen address: {err}")))?;
    info!(provider = %gateway.current_provider(), "starting health companion");
    serve(AppState::new(session, gateway, analyzer, predictions), addr).await
}
