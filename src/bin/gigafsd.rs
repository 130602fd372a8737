//! GigaFS metadata server daemon
//!
//! Loads the cluster configuration, starts the RPC acceptor and the
//! split engine, and serves until killed. Server 0 additionally creates
//! the root directory's mapping row on startup.

use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;

use gigafs::config::ServerConfig;
use gigafs::rpc::RpcServer;
use gigafs::server::MetadataServer;
use gigafs::store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "gigafsd", about = "GigaFS metadata server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gigafs.toml")]
    config: String,

    /// Override the server id from the configuration file
    #[arg(long)]
    server_id: Option<u32>,
}

fn main() {
    let args = Args::parse();

    let mut config = match ServerConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(server_id) = args.server_id {
        config.node.server_id = server_id;
        if let Err(e) = config.validate() {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    }

    gigafs::logging::init(&config.node.log_level, Some(config.node.server_id));

    if let Err(e) = run(config) {
        tracing::error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    for dir in [
        &config.paths.store_dir,
        &config.paths.file_dir,
        &config.paths.split_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let listen_addr = config.listen_addr()?;
    let server_id = config.node.server_id;
    let store = Arc::new(MemStore::new(server_id));
    let config = Arc::new(config);

    let (server, _split_engine) = MetadataServer::new(Arc::clone(&config), store)?;

    if server_id == 0 {
        server.bootstrap_root()?;
        tracing::info!("Root directory bootstrapped");
    }

    let listener = TcpListener::bind(listen_addr)?;
    tracing::info!(
        "gigafsd server {} of {} starting on {}",
        server_id,
        config.server_count(),
        listen_addr
    );

    let acceptor = RpcServer::spawn(server, listener);
    acceptor
        .join()
        .map_err(|_| "acceptor thread panicked".to_string())?;
    Ok(())
}
