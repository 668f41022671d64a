use clap::Parser;
use std::time::Duration;

use convoy_core::config::{default_node_id, CoordinatorConfig};
use convoy_types::ConflictStrategy;

#[derive(Parser)]
#[command(
    name = "convoy-server",
    about = "Convoy - high-availability sync coordinator daemon",
    version = env!("CARGO_PKG_VERSION"),
    author,
    propagate_version = true
)]
pub struct Cli {
    /// Postgres connection string for the authoritative store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(short, long, env = "CONVOY_PORT", default_value = "8060")]
    pub port: u16,

    /// Unique container identifier. Defaults to `hostname-pid`.
    #[arg(long, env = "CONVOY_NODE_ID")]
    pub node_id: Option<String>,

    /// Logical lock name shared by all containers of one fleet.
    #[arg(long, env = "CONVOY_LOCK_NAME", default_value = "sync-leader")]
    pub lock_name: String,

    #[arg(long, env = "LEASE_TTL_SECONDS", default_value = "15")]
    pub lease_ttl_seconds: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value = "5")]
    pub heartbeat_interval_seconds: u64,

    /// Upper bound on any single store round trip.
    #[arg(long, env = "STORE_TIMEOUT_SECONDS", default_value = "4")]
    pub store_timeout_seconds: u64,

    #[arg(long, env = "CACHE_FRESHNESS_SECONDS", default_value = "30")]
    pub cache_freshness_seconds: u64,

    /// Serve a stale cache entry when the store fetch fails.
    #[arg(
        long,
        env = "ALLOW_STALE_READS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub allow_stale_reads: bool,

    #[arg(long, env = "SYNC_BATCH_SIZE", default_value = "50")]
    pub sync_batch_size: usize,

    /// Default conflict strategy: last-write-wins, merge, or escalate.
    #[arg(long, env = "CONFLICT_STRATEGY", default_value = "last-write-wins")]
    pub conflict_strategy: ConflictStrategy,

    #[arg(short, long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Run single-node against an in-memory store. For local development;
    /// nothing survives a restart.
    #[arg(long)]
    pub standalone: bool,
}

impl Cli {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: self.node_id.clone().unwrap_or_else(default_node_id),
            lock_name: self.lock_name.clone(),
            lease_ttl: Duration::from_secs(self.lease_ttl_seconds),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            store_timeout: Duration::from_secs(self.store_timeout_seconds),
            cache_freshness: Duration::from_secs(self.cache_freshness_seconds),
            allow_stale_read_on_fetch_failure: self.allow_stale_reads,
            sync_batch_size: self.sync_batch_size,
            conflict_strategy: self.conflict_strategy,
        }
    }
}
