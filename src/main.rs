use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use gateway_relay::config::Config;
use gateway_relay::credentials::{CliTokenBroker, CredentialProvider};
use gateway_relay::{discovery, forward, logging, server};

/// Readiness window for a freshly started relay.
const STARTUP_WINDOW: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let Some(workspace) = config.workspace_url() else {
        bail!(
            "no workspace configured; pass --workspace or set {}",
            gateway_relay::config::HOST_ENV
        );
    };

    let log_path = logging::init_logging(config.log_file.clone().map(Into::into), &config.log_level)?;
    tracing::info!(
        workspace = %workspace,
        log = %log_path.display(),
        port = config.port,
        "gateway-relay starting"
    );

    let (port, already_running) = discovery::acquire_port(&workspace, config.port).await?;
    if already_running {
        tracing::info!(port, "compatible relay already listening, reusing it");
        return Ok(());
    }

    let state = server::AppState {
        provider: Arc::new(CredentialProvider::from_env(
            workspace.clone(),
            Arc::new(CliTokenBroker::default()),
        )),
        upstream: forward::upstream_client()?,
        workspace,
    };

    let listener = server::bind(port).await?;

    // A fresh instance must answer health probes within the startup window;
    // failing that exits non-zero so a launcher watching us sees the failure.
    let serve = server::serve(listener, state);
    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => result?,
        ready = discovery::wait_until_ready(port, STARTUP_WINDOW) => {
            if let Err(err) = ready {
                tracing::error!(error = %err, "relay failed its own readiness probe");
                return Err(err.into());
            }
            serve.await?;
        }
    }
    Ok(())
}
