//! fls-daemon entry point.
//!
//! Runs every enabled loop concurrently: driver sync, leave sync and the
//! API dispatcher. SIGINT/SIGTERM flips the shared stop signal; each loop
//! finishes its current cycle (or wakes from its sleep) and exits.

use anyhow::Result;
use fls_config::Settings;
use fls_daemon::{
    build_dispatch, build_driver_sync, build_leave_sync, init_tracing, interval_seconds,
    shutdown_channel, wait_for_shutdown_signal,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars.
    let _ = dotenvy::dotenv();

    init_tracing();

    let settings = Settings::from_env()?;
    let source_db = settings.source_database_prod.clone();

    let driver_sync = build_driver_sync(&settings, &source_db).await?;
    let leave_sync = build_leave_sync(&settings, &source_db).await?;
    let dispatch = build_dispatch(&settings, true, true).await?;

    let (stop_tx, stop_rx) = shutdown_channel();

    let driver_interval = interval_seconds(settings.driver_sync_interval_seconds);
    let leave_interval = interval_seconds(settings.leave_sync_interval_seconds);
    let dispatch_interval = interval_seconds(settings.dispatch_interval_seconds);

    info!(
        source_db = %source_db,
        target_db = %settings.target_database,
        "fls-daemon starting"
    );

    let driver_rx = stop_rx.clone();
    let leave_rx = stop_rx.clone();
    let dispatch_rx = stop_rx;

    let driver_task =
        tokio::spawn(async move { driver_sync.run_loop(driver_interval, driver_rx).await });
    let leave_task =
        tokio::spawn(async move { leave_sync.run_loop(leave_interval, leave_rx).await });
    let dispatch_task =
        tokio::spawn(async move { dispatch.run_loop(dispatch_interval, dispatch_rx).await });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping loops");
    let _ = stop_tx.send(true);

    let _ = driver_task.await;
    let _ = leave_task.await;
    let _ = dispatch_task.await;

    info!("fls-daemon stopped");
    Ok(())
}
