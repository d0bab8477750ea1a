use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{
    config::{DEFAULT_LEASE_DURATION, DEFAULT_RELEASE_COOLDOWN_MULTIPLIER, DEFAULT_TICK_PERIOD},
    election::{BroadcastEventSink, ElectionManager, SqliteElectionStore, SystemClock},
    http::create_app,
    ElectionConfig,
};

#[derive(Parser, Debug)]
#[command(version, about = "Lease-based leader election over a shared SQLite database")]
struct Args {
    /// Database file shared by every peer
    #[arg(long, default_value = "leasehold.db")]
    database: PathBuf,

    /// Name written into the election record when this peer leads (defaults to $HOSTNAME)
    #[arg(long)]
    identity: Option<String>,

    /// Address of the admin HTTP server
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Election key to join at startup; may be repeated
    #[arg(long = "elect", value_name = "KEY")]
    elect: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_TICK_PERIOD.as_millis() as u64)]
    tick_ms: u64,

    #[arg(long, default_value_t = DEFAULT_LEASE_DURATION.as_millis() as u64)]
    lease_ms: u64,

    /// Leases to sit out after a voluntary release
    #[arg(long, default_value_t = DEFAULT_RELEASE_COOLDOWN_MULTIPLIER)]
    release_cooldown: u32,
}

impl Args {
    fn election_config(&self) -> ElectionConfig {
        let mut config = ElectionConfig {
            tick_period: Duration::from_millis(self.tick_ms),
            lease_duration: Duration::from_millis(self.lease_ms),
            release_cooldown_multiplier: self.release_cooldown,
            ..ElectionConfig::default()
        };
        if let Some(identity) = &self.identity {
            config.identity = identity.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.election_config();

    let store = SqliteElectionStore::open(&args.database, Arc::new(SystemClock))
        .with_context(|| format!("opening election database {}", args.database.display()))?;
    let events = Arc::new(BroadcastEventSink::new());
    let manager = Arc::new(ElectionManager::new(Arc::new(store), events.clone(), config)?);

    for key in &args.elect {
        manager
            .start_leader_election(key)
            .with_context(|| format!("starting leader election {key}"))?;
    }

    let app = create_app(manager.clone(), events);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(addr = %listener.local_addr()?, identity = manager.identity(), "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down, stopping leader elections");
    manager.stop_leader_elections().await;

    Ok(())
}
