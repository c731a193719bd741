//! Server configuration, parsed once in `main` (component G).

use clap::Parser;

/// Default bound on how long a conduit exchange will wait for a peer
/// before surfacing a transport-level timeout.
pub const DEFAULT_PEER_EVENT_MAX_WAIT_SECS: u64 = 300;

#[derive(Debug, Clone, Parser)]
#[command(name = "invite-conduit", about = "Invitation conduit server")]
pub struct Config {
    /// Address to bind the HTTP API on.
    #[arg(long, default_value = "127.0.0.1:8088", env = "INVITE_CONDUIT_LISTEN")]
    pub listen_addr: String,

    /// Path to the sqlite database file. Omit for an in-memory store
    /// (invitations do not survive a restart).
    #[arg(long, env = "INVITE_CONDUIT_DB")]
    pub db_path: Option<String>,

    /// Upper bound, in seconds, on how long a conduit RPC will block
    /// waiting for the peer before failing with a transport timeout.
    #[arg(long, default_value_t = DEFAULT_PEER_EVENT_MAX_WAIT_SECS, env = "INVITE_CONDUIT_PEER_WAIT_SECS")]
    pub peer_event_max_wait_secs: u64,
}

/// Install a `tracing` subscriber. JSON logs in production
/// (`INVITE_CONDUIT_LOG_JSON=1`), human-readable otherwise.
pub fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let json_logs = std::env::var("INVITE_CONDUIT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("invite_conduit=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
