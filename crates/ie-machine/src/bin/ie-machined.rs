//! Coprocessor subsystem host process.
//!
//! Builds a [`Machine`] from environment configuration and, if
//! `IE_STATUS_BIND` is set, serves the read-only status surface until
//! interrupted. The machine itself is driven by whatever master CPU front-end
//! embeds `ie-bus`/`ie-coproc`; this binary exists to host the coprocessor
//! side as a standalone process for local development and the status API.

use std::sync::Arc;

use anyhow::Result;
use ie_machine::{Machine, MachineConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = MachineConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match &config.log_filter {
            Some(raw) => EnvFilter::try_new(raw),
            None => EnvFilter::try_new("info,ie_coproc=debug"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info,ie_coproc=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();

    tracing::info!(?config, "starting ie-machined");

    let machine = Arc::new(Machine::new(config)?);

    if let Some(addr) = machine.config().status_bind {
        let app = ie_machine::status::router(machine.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "status surface listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(%err, "status surface exited");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    machine.shutdown();
    Ok(())
}
