use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use gamelease_daemon::clock::{self, ReservationClock};
use gamelease_daemon::config;
use gamelease_daemon::db::{self, PgReservationStore};
use gamelease_daemon::filesync::FtpTransport;
use gamelease_daemon::lifecycle::ReservationLifecycle;
use gamelease_daemon::rcon::SourceRcon;
use gamelease_daemon::shell::OpensshShell;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Reservation lifecycle daemon for leased game servers")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/gamelease/daemon.toml")]
    config: PathBuf,

    /// Apply pending migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), "starting gamelease-daemon");
    let config = config::load(&args.config).await?;

    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;
    info!("database migrations applied");
    if args.migrate_only {
        return Ok(());
    }

    let store = Arc::new(PgReservationStore::new(pool));
    let rcon = Arc::new(SourceRcon::new(config.rcon.timeout()));
    let transport = Arc::new(FtpTransport::new(Duration::from_secs(
        config.ftp.connect_timeout_secs,
    )));
    let shell = Arc::new(OpensshShell::new(Duration::from_secs(config.ssh.timeout_secs)));
    let lifecycle = Arc::new(ReservationLifecycle::new(
        store, rcon, transport, shell, &config,
    )?);

    let (health_tx, health_rx) = mpsc::channel(config.lifecycle.health_queue_capacity);
    let worker = clock::spawn_health_worker(lifecycle.clone(), health_rx);

    ReservationClock::new(lifecycle, health_tx)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    if let Err(e) = worker.await {
        error!(error = %e, "health worker panicked");
    }
    info!("shutdown complete");
    Ok(())
}
