use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_executor::{
    DirectRuntime, Executor, ExecutorConfig, ExecutorError, ExecutorResult, HttpFetcher,
    JsonLinesChannel,
};
use mesh_proto::ControlUrl;

#[tokio::main]
async fn main() -> ExecutorResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ExecutorConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load configuration, using defaults");
        ExecutorConfig::default()
    });

    let control = ControlUrl::parse(&config.control_url)?;
    tokio::fs::create_dir_all(config.containers_dir())
        .await
        .map_err(|e| {
            ExecutorError::config(format!(
                "create {}: {e}",
                config.containers_dir().display()
            ))
        })?;

    let (channel, inbound) = JsonLinesChannel::connect(&control).await?;
    let executor = Executor::new(
        config,
        control,
        Arc::new(channel),
        Arc::new(DirectRuntime),
        Arc::new(HttpFetcher::new()),
    );

    tokio::select! {
        result = executor.run(inbound) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
