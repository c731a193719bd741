use anyhow::Result;
use clap::Parser;

use invite_conduit::config::{init_tracing, Config};
use invite_conduit::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = Config::parse();
    tracing::info!(listen_addr = %config.listen_addr, "starting invitation conduit");
    if config.db_path.is_none() {
        tracing::warn!("no --db-path given, invitations will not survive a restart");
    }

    let server = Server::new(config);
    server.run().await
}
