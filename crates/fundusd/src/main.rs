use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FundusService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fundusd starting");

    let config = config::Config::from_env();
    let engine = engine::spawn_engine(&config).context("failed to acquire rig hardware")?;

    if config.autostart_preview {
        if let Err(e) = engine.start_preview().await {
            tracing::warn!(error = %e, "preview did not start; waiting for StartPreview");
        }
    }

    // Mirror status messages into the log.
    let mut status_rx = engine.subscribe();
    tokio::spawn(async move {
        let mut last = String::new();
        while status_rx.changed().await.is_ok() {
            let message = status_rx.borrow_and_update().message.clone();
            if message != last {
                tracing::info!(status = %message, "rig status");
                last = message;
            }
        }
    });

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FundusService::new(engine.clone()))?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on D-Bus"))?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "fundusd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("fundusd shutting down");
    engine.stop_preview().await?;

    Ok(())
}
