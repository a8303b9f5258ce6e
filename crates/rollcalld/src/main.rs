use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod dbus_interface;
mod engine;
mod login;
mod recognition;
mod registration;
mod settings;
mod sync;
#[cfg(test)]
mod testutil;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        api = %config.api_url,
        engine = %config.engine_url,
        db = %config.db_path.display(),
        frames = %config.frame_path.display(),
        layout = ?config.frame_layout,
        "configuration loaded"
    );

    let app = Arc::new(app::App::open(config).await?);

    let service = dbus_interface::AttendanceService::new(app.clone());
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    app.shutdown().await;

    Ok(())
}
