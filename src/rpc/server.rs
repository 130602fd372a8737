//! Threaded RPC acceptor
//!
//! One acceptor thread per server; every accepted connection gets its own
//! worker thread that loops request -> dispatch -> reply until the peer
//! hangs up. Handlers may block (lease waits, store I/O), which is why
//! connections do not share threads.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::connection::Connection;
use super::proto::Request;
use crate::server::MetadataServer;

pub struct RpcServer;

impl RpcServer {
    /// Run the accept loop on an already-bound listener.
    ///
    /// Binding is left to the caller so tests can grab an ephemeral port
    /// before wiring the cluster together.
    pub fn spawn(server: Arc<MetadataServer>, listener: TcpListener) -> JoinHandle<()> {
        let server_id = server.server_id();
        std::thread::Builder::new()
            .name(format!("rpc-accept-{server_id}"))
            .spawn(move || Self::accept_loop(server, listener))
            .unwrap_or_else(|e| panic!("failed to spawn acceptor thread: {e}"))
    }

    fn accept_loop(server: Arc<MetadataServer>, listener: TcpListener) {
        tracing::info!(
            "Server {} listening on {:?}",
            server.server_id(),
            listener.local_addr().ok()
        );
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    let server = Arc::clone(&server);
                    let spawned = std::thread::Builder::new()
                        .name(format!("rpc-worker-{}", server.server_id()))
                        .spawn(move || Self::serve_connection(server, stream));
                    if let Err(e) = spawned {
                        tracing::error!("Failed to spawn worker thread: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                }
            }
        }
    }

    fn serve_connection(server: Arc<MetadataServer>, stream: TcpStream) {
        let mut conn = match Connection::from_stream(stream) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Dropping connection during setup: {}", e);
                return;
            }
        };
        loop {
            let request: Request = match conn.recv() {
                Ok(request) => request,
                Err(e) => {
                    // Peers hang up between requests; anything else is
                    // worth a line in the log.
                    tracing::debug!("Connection closed: {}", e);
                    return;
                }
            };
            let op = request.op_name();
            let result = server.dispatch(request);
            if let Err(ref e) = result {
                tracing::debug!("{} failed: {}", op, e);
            }
            if let Err(e) = conn.send(&result) {
                tracing::warn!("Failed to send {} reply: {}", op, e);
                return;
            }
        }
    }
}
