//! collab-sync-server: standalone sync server.
//!
//! Configuration comes from `COLLAB_SYNC_*` environment variables; tokens
//! are HS256 JWTs signed with `COLLAB_SYNC_JWT_SECRET`.

use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

use collab_sync::{JwtVerifier, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = ServerConfig::from_env();
    let Some(secret) = std::env::var("COLLAB_SYNC_JWT_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
    else {
        error!("COLLAB_SYNC_JWT_SECRET is not set");
        return ExitCode::FAILURE;
    };
    let verifier = Arc::new(JwtVerifier::new(secret.as_bytes()));

    let server = match SyncServer::from_config(config, verifier) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.start().await {
        error!("Failed to start server: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received");

    let report = server.stop().await;
    if report.flushes_abandoned || report.flush_failures > 0 {
        error!("Shutdown left unflushed documents: {report:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
