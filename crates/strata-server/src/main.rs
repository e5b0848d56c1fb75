//! strata-server: serve a directory over the strata file protocol.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use strata_core::{FileServer, LocalFileSystem};
use tokio::net::TcpListener;

/// Serve a directory of plain and versioned files over HTTP
#[derive(Parser, Debug)]
#[command(name = "strata-server", version, about)]
struct ServerConfig {
    /// Directory to serve (created if missing)
    #[arg(value_name = "ROOT")]
    root: PathBuf,

    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Context lines for diffs that do not request a specific amount
    #[arg(long = "diff-context", value_name = "LINES", default_value_t = strata_core::vfs::DEFAULT_DIFF_CONTEXT)]
    diff_context: usize,

    /// URL prefix the endpoints live under, e.g. /api
    #[arg(long = "prefix", default_value = "")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::parse();

    let local = LocalFileSystem::new(&config.root)?;
    let server = FileServer::new(local)
        .with_diff_context(config.diff_context)
        .with_prefix(&config.prefix);

    let listener = TcpListener::bind(config.bind).await?;
    log::info!("listening on {}", listener.local_addr()?);
    Arc::new(server).serve(listener).await?;
    Ok(())
}
