use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use switchboard::{
    book::SyncAddrBook,
    config::Config,
    peer::Plaintext,
    pex::{PexConfig, PexReactor},
    switch::Switch,
    NodeKey, Reactor,
};
use tracing::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Runs a node that keeps itself connected to the overlay.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a TOML configuration file, defaults are used if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let book = SyncAddrBook::new(config.addr_book_path(), config.addr_book_strict);
    match book.load() {
        Ok(true) => info!(addrs = book.size(), "loaded the address book"),
        Ok(false) => info!(path = %book.file_path().display(), "starting with an empty address book"),
        Err(e) => warn!(error = %e, "ignoring unreadable address book"),
    }

    let mut reactors: Vec<Arc<dyn Reactor>> = Vec::new();
    if config.pex {
        reactors.push(Arc::new(PexReactor::new(book.clone(), PexConfig::default())));
    }

    // TODO: persist the node key next to the address book once a secure transport is wired in.
    let node_key = NodeKey::generate();
    let switch = Switch::new(config, node_key, book, Arc::new(Plaintext), reactors)
        .context("failed to create the switch")?;

    switch.bind().await.context("failed to bind the listener")?;
    switch.start().context("failed to start the switch")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    switch.stop();

    Ok(())
}
