//! Wiring: builds engines from [`Settings`] and the on-disk client
//! registry. Shared by the daemon and the operational CLI so both binaries
//! assemble the exact same pipeline.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;

use fls_api::{
    ApiClient, ClientProfile, ClientRegistry, RegistryDefaults, ENDPOINT_KIND_DRIVERS,
    ENDPOINT_KIND_LEAVES, REGISTRY_FILE,
};
use fls_config::Settings;
use fls_db::{DriverOutbox, DriverSourceReader, LeaveOutbox, LeaveSourceReader};
use fls_dispatch::{DispatchEngine, EnrichmentDefaults, QueueConfig, RetryPolicy};
use fls_sync::{DriverSyncEngine, LeaveSyncEngine};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Watch-channel based stop signal: `true` means "shut down". Loops check
/// it between cycles and select on it during their sleeps.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves SIGINT/SIGTERM into the cooperative stop signal.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn source_pool(settings: &Settings, source_db: &str) -> Result<PgPool> {
    fls_db::connect(&settings.database_url(source_db))
        .await
        .with_context(|| format!("connect to source database {source_db:?}"))
}

pub async fn target_pool(settings: &Settings) -> Result<PgPool> {
    fls_db::connect(&settings.database_url(&settings.target_database))
        .await
        .with_context(|| format!("connect to target database {:?}", settings.target_database))
}

pub fn open_registry(settings: &Settings) -> ClientRegistry {
    ClientRegistry::new(REGISTRY_FILE, RegistryDefaults::from_settings(settings))
}

/// Active client profile, or the `.env`-backed default when the registry
/// has none.
pub fn resolve_profile(registry: &ClientRegistry) -> ClientProfile {
    registry
        .active_profile()
        .unwrap_or_else(|| registry.default_profile())
}

pub async fn build_driver_sync(settings: &Settings, source_db: &str) -> Result<DriverSyncEngine> {
    let source_pool = source_pool(settings, source_db).await?;
    let target_pool = target_pool(settings).await?;

    let schema = settings.source_schema_for_database(source_db);
    let source = DriverSourceReader::connect(source_pool, schema).await?;
    let outbox = DriverOutbox::connect(
        target_pool,
        &settings.target_schema,
        &settings.target_driver_table,
    )
    .await?;

    Ok(DriverSyncEngine::new(
        source,
        outbox,
        source_db,
        settings.driver_sync_batch_size,
    ))
}

pub async fn build_leave_sync(settings: &Settings, source_db: &str) -> Result<LeaveSyncEngine> {
    let source_pool = source_pool(settings, source_db).await?;
    let target_pool = target_pool(settings).await?;

    let schema = settings.source_schema_for_database(source_db);
    let source = LeaveSourceReader::new(source_pool, schema)?;
    let outbox = LeaveOutbox::connect(
        target_pool,
        &settings.target_schema,
        &settings.target_leave_table,
    )
    .await?;

    Ok(LeaveSyncEngine::new(
        source,
        outbox,
        source_db,
        settings.leave_sync_batch_size,
        settings.leave_start_date()?,
    ))
}

/// Assembles the dispatch engine from the active client profile: its
/// credentials, endpoints and mapping rules, with the `.env` endpoints as
/// fallback.
pub async fn build_dispatch(
    settings: &Settings,
    process_drivers: bool,
    process_leaves: bool,
) -> Result<DispatchEngine> {
    let registry = open_registry(settings);
    let profile = resolve_profile(&registry);

    let mut creds = profile.credentials();
    if creds.login_url.trim().is_empty() && creds.base_url.trim().is_empty() {
        creds.login_url = settings.api_login_url.clone();
        creds.base_url = settings.api_base_url.clone();
        creds.user = settings.api_user.clone();
        creds.password = settings.api_pass.clone();
        creds.timeout_seconds = settings.api_timeout_seconds;
    }
    let client = ApiClient::new(creds)?;

    let policy = RetryPolicy {
        max_attempts: settings.dispatch_max_attempts,
        lock_timeout_minutes: settings.dispatch_lock_timeout_minutes,
        retry_base_seconds: settings.dispatch_retry_base_seconds,
        retry_max_seconds: settings.dispatch_retry_max_seconds,
    };
    let defaults = EnrichmentDefaults::from_settings(settings);

    let target = target_pool(settings).await?;

    let drivers = if process_drivers {
        let endpoint = profile.endpoint(ENDPOINT_KIND_DRIVERS);
        let outbox = DriverOutbox::connect(
            target.clone(),
            &settings.target_schema,
            endpoint
                .map(|e| e.target_table.trim())
                .filter(|t| !t.is_empty())
                .unwrap_or(&settings.target_driver_table),
        )
        .await?;
        Some((
            outbox,
            QueueConfig {
                endpoint: endpoint
                    .map(|e| e.path.clone())
                    .unwrap_or_else(|| settings.api_driver_endpoint.clone()),
                batch_size: settings.dispatch_batch_size_drivers,
                rules: endpoint.map(|e| e.rules.clone()).unwrap_or_default(),
            },
        ))
    } else {
        None
    };

    let leaves = if process_leaves {
        let endpoint = profile.endpoint(ENDPOINT_KIND_LEAVES);
        let outbox = LeaveOutbox::connect(
            target.clone(),
            &settings.target_schema,
            endpoint
                .map(|e| e.target_table.trim())
                .filter(|t| !t.is_empty())
                .unwrap_or(&settings.target_leave_table),
        )
        .await?;
        Some((
            outbox,
            QueueConfig {
                endpoint: endpoint
                    .map(|e| e.path.clone())
                    .unwrap_or_else(|| settings.api_leave_endpoint.clone()),
                batch_size: settings.dispatch_batch_size_leaves,
                rules: endpoint.map(|e| e.rules.clone()).unwrap_or_default(),
            },
        ))
    } else {
        None
    };

    DispatchEngine::new(client, policy, defaults, drivers, leaves)
}

/// Interval helpers, clamped to at least one second.
pub fn interval_seconds(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}
