//! Intercept Agent Binary Entry Point

use clap::Parser;
use intercept_agent::{logging::init_logging, run_agent, Args};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args.logging_config())?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping agent...");
        }
        signal.cancel();
    });

    if let Err(e) = run_agent(args, shutdown).await {
        tracing::error!("Agent failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
