//! Operational CLI: one-shot cycles for each engine, continuous mode, db
//! connectivity checks and registry management. Exit code is non-zero on
//! configuration errors; in continuous mode only signals terminate.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fls_config::Settings;
use fls_daemon::{
    build_dispatch, build_driver_sync, build_leave_sync, init_tracing, interval_seconds,
    open_registry, shutdown_channel, wait_for_shutdown_signal,
};

#[derive(Parser)]
#[command(name = "fls")]
#[command(about = "fleetsync: HR -> fleet API integration pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Driver sync engine (employee master -> outbox)
    SyncDrivers {
        /// Run exactly one cycle and exit
        #[arg(long)]
        one_shot: bool,

        /// Source database (defaults to SOURCE_DATABASE_PROD)
        #[arg(long)]
        source_db: Option<String>,
    },

    /// Leave sync engine (leave-of-absence -> outbox)
    SyncLeaves {
        #[arg(long)]
        one_shot: bool,

        #[arg(long)]
        source_db: Option<String>,
    },

    /// Outbox dispatcher (outbox -> target API)
    Dispatch {
        #[arg(long)]
        one_shot: bool,

        /// Process only the driver queue
        #[arg(long, conflicts_with = "leaves_only")]
        drivers_only: bool,

        /// Process only the leave queue
        #[arg(long, conflicts_with = "drivers_only")]
        leaves_only: bool,
    },

    /// Drop sync state (hashes + cursor) for one source database
    ResetSync {
        #[command(subcommand)]
        cmd: ResetCmd,
    },

    /// Client registry commands
    Registry {
        #[command(subcommand)]
        cmd: RegistryCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Check connectivity against the destination database
    Status,
}

#[derive(Subcommand)]
enum ResetCmd {
    Drivers {
        #[arg(long)]
        source_db: Option<String>,
    },
    Leaves {
        #[arg(long)]
        source_db: Option<String>,
    },
}

#[derive(Subcommand)]
enum RegistryCmd {
    /// Print all profiles and which one is active
    Show,
    /// Mark a profile as the active one
    SetActive { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let pool = fls_daemon::target_pool(&settings).await?;
                let ok = fls_db::status(&pool).await?;
                println!("db_ok={ok}");
            }
        },

        Commands::SyncDrivers { one_shot, source_db } => {
            let source_db = source_db.unwrap_or_else(|| settings.source_database_prod.clone());
            let engine = build_driver_sync(&settings, &source_db).await?;
            if one_shot {
                let report = engine.run_cycle().await?;
                println!("{}", serde_json::to_string(&report)?);
            } else {
                let interval = interval_seconds(settings.driver_sync_interval_seconds);
                run_until_signal(move |rx| async move { engine.run_loop(interval, rx).await })
                    .await;
            }
        }

        Commands::SyncLeaves { one_shot, source_db } => {
            let source_db = source_db.unwrap_or_else(|| settings.source_database_prod.clone());
            let engine = build_leave_sync(&settings, &source_db).await?;
            if one_shot {
                let report = engine.run_cycle().await?;
                println!("{}", serde_json::to_string(&report)?);
            } else {
                let interval = interval_seconds(settings.leave_sync_interval_seconds);
                run_until_signal(move |rx| async move { engine.run_loop(interval, rx).await })
                    .await;
            }
        }

        Commands::Dispatch {
            one_shot,
            drivers_only,
            leaves_only,
        } => {
            let engine = build_dispatch(&settings, !leaves_only, !drivers_only).await?;
            if one_shot {
                let report = engine.run_cycle().await?;
                println!("{}", serde_json::to_string(&report)?);
            } else {
                let interval = interval_seconds(settings.dispatch_interval_seconds);
                run_until_signal(move |rx| async move { engine.run_loop(interval, rx).await })
                    .await;
            }
        }

        Commands::ResetSync { cmd } => match cmd {
            ResetCmd::Drivers { source_db } => {
                let source_db = source_db.unwrap_or_else(|| settings.source_database_prod.clone());
                let engine = build_driver_sync(&settings, &source_db).await?;
                engine.reset_sync_state().await?;
                println!("driver sync state reset for {source_db}");
            }
            ResetCmd::Leaves { source_db } => {
                let source_db = source_db.unwrap_or_else(|| settings.source_database_prod.clone());
                let engine = build_leave_sync(&settings, &source_db).await?;
                engine.reset_sync_state().await?;
                println!("leave sync state reset for {source_db}");
            }
        },

        Commands::Registry { cmd } => {
            let registry = open_registry(&settings);
            match cmd {
                RegistryCmd::Show => {
                    let active = registry.active_id().unwrap_or_default();
                    for profile in registry.list_profiles() {
                        let marker = if profile.id == active { "*" } else { " " };
                        println!(
                            "{marker} {} {} ({} endpoints)",
                            profile.id,
                            profile.name,
                            profile.endpoints.len()
                        );
                    }
                }
                RegistryCmd::SetActive { id } => {
                    registry.set_active(&id)?;
                    println!("active_id={id}");
                }
            }
        }
    }

    Ok(())
}

/// Runs one engine loop until SIGINT/SIGTERM.
async fn run_until_signal<F, Fut>(start: F)
where
    F: FnOnce(tokio::sync::watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = shutdown_channel();
    let task = tokio::spawn(start(stop_rx));
    wait_for_shutdown_signal().await;
    let _ = stop_tx.send(true);
    let _ = task.await;
}
