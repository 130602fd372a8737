//! RPC client endpoints
//!
//! One lazily-connected, persistent connection per peer server. The
//! per-endpoint mutex serializes calls and reconnect attempts on that
//! endpoint; distinct endpoints proceed in parallel. A call that fails on
//! a previously-used connection gets one reconnect before the error is
//! surfaced, since the failure usually just means the peer restarted.

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;

use super::connection::Connection;
use super::proto::{FsError, OpResult, Reply, Request};
use super::{RpcError, RpcResult};
use crate::metadata::ServerId;

pub struct RpcClient {
    endpoints: Vec<SocketAddr>,
    conns: Vec<Mutex<Option<Connection>>>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(endpoints: Vec<SocketAddr>, timeout: Duration) -> Self {
        let conns = endpoints.iter().map(|_| Mutex::new(None)).collect();
        Self {
            endpoints,
            conns,
            timeout,
        }
    }

    pub fn server_count(&self) -> u32 {
        self.endpoints.len() as u32
    }

    /// Issue one RPC to the given server and wait for its reply.
    ///
    /// Transport failures come back as `FsError::Io`; operation failures
    /// (including redirections) are whatever the server answered.
    pub fn call(&self, server: ServerId, request: &Request) -> Result<Reply, FsError> {
        self.try_call(server, request)
            .map_err(|e| FsError::Io(e.to_string()))?
    }

    fn try_call(&self, server: ServerId, request: &Request) -> RpcResult<OpResult> {
        let slot = self
            .conns
            .get(server as usize)
            .ok_or(RpcError::UnknownServer(server))?;
        let addr = self.endpoints[server as usize];

        let mut guard = slot.lock();
        let reused = guard.is_some();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => guard.insert(Connection::connect(addr, self.timeout)?),
        };

        match Self::round_trip(conn, request) {
            Ok(reply) => Ok(reply),
            Err(e) if reused => {
                // The cached connection may be stale; retry on a fresh one.
                tracing::debug!(
                    "Reconnecting to server {} after transport error: {}",
                    server,
                    e
                );
                let conn = guard.insert(Connection::connect(addr, self.timeout)?);
                match Self::round_trip(conn, request) {
                    Ok(reply) => Ok(reply),
                    Err(e) => {
                        *guard = None;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn round_trip(conn: &mut Connection, request: &Request) -> RpcResult<OpResult> {
        conn.send(request)?;
        conn.recv()
    }
}
