//! Framed message transport
//!
//! One frame is a little-endian u32 length followed by a bincode payload.
//! Connections are blocking; each side alternates send and receive per
//! the request/response protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{RpcError, RpcResult, MAX_FRAME_LEN};

pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Dial a peer with a connect timeout.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> RpcResult<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> RpcResult<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn send<T: Serialize>(&mut self, msg: &T) -> RpcResult<()> {
        let payload = bincode::serialize(msg).map_err(|e| RpcError::Encode(e.to_string()))?;
        if payload.len() as u32 > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge(payload.len() as u32));
        }
        self.stream.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> RpcResult<T> {
        let len = self.stream.read_u32::<LittleEndian>()?;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload)?;
        bincode::deserialize(&payload).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_frame_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Connection::from_stream(stream).unwrap();
            let msg: Vec<u8> = conn.recv().unwrap();
            conn.send(&msg).unwrap();
        });

        let mut conn = Connection::connect(addr, Duration::from_secs(5)).unwrap();
        let sent = vec![1u8, 2, 3, 4, 5];
        conn.send(&sent).unwrap();
        let back: Vec<u8> = conn.recv().unwrap();
        assert_eq!(back, sent);
        echo.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // A port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(Connection::connect(addr, Duration::from_millis(500)).is_err());
    }
}
