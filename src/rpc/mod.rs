// RPC layer: length-prefixed bincode frames over TCP
pub mod client;
pub mod connection;
pub mod proto;
pub mod server;

pub use client::RpcClient;
pub use connection::Connection;
pub use proto::{FsError, OpResult, Reply, Request, WireBitmap};
pub use server::RpcServer;

/// Transport-level errors; operation-level failures travel inside
/// [`proto::OpResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(u32),

    #[error("Unknown server index {0}")]
    UnknownServer(u32),
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Upper bound on a single frame. Embedded file bodies cap at 64 KiB and
/// readdir pages at 256 rows, so anything near this is corruption.
pub const MAX_FRAME_LEN: u32 = 16 << 20;
