//! TCP primitives shared by the MLLP listener and client.
//!
//! Grounded on the teacher toolkit's `net.rs` `tcp` module (`RUMServer`/`RUMClient`): an accept
//! loop that hands each connection its own task, plus a client type used both for outbound
//! connections and for the per-connection handle the server keeps. Trimmed down to what MLLP
//! framing actually needs — a line-free byte stream with explicit read/write — rather than the
//! teacher's broader readiness-polling API surface.

use crate::error::{EngineError, EngineResult};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One accepted (or outbound) TCP connection, wrapped for the framing layer above it.
pub struct Connection {
    stream: TcpStream,
    pub peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Connection { stream, peer_addr }
    }

    pub async fn connect(addr: &str) -> EngineResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| EngineError::transport(format!("connect to {addr} failed: {e}")))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| EngineError::transport(format!("no peer addr: {e}")))?;
        Ok(Connection { stream, peer_addr })
    }

    /// Reads a single byte, or `Err` if the connection closed.
    pub async fn read_byte(&mut self) -> EngineResult<u8> {
        let mut byte = [0u8; 1];
        let n = self
            .stream
            .read(&mut byte)
            .await
            .map_err(|e| EngineError::transport(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(EngineError::transport("connection closed"));
        }
        Ok(byte[0])
    }

    /// Reads until `delimiter` is seen (inclusive), or the connection closes.
    pub async fn read_until(&mut self, delimiter: u8) -> EngineResult<Vec<u8>> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self
                .stream
                .read(&mut byte)
                .await
                .map_err(|e| EngineError::transport(format!("read failed: {e}")))?;
            if n == 0 {
                if buf.is_empty() {
                    return Err(EngineError::transport("connection closed"));
                }
                return Err(EngineError::transport("connection closed mid-message"));
            }
            buf.push(byte[0]);
            if byte[0] == delimiter {
                return Ok(buf);
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> EngineResult<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| EngineError::transport(format!("write failed: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| EngineError::transport(format!("flush failed: {e}")))
    }
}

/// A bound listener that hands each accepted connection to `handler` on its own task.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    pub async fn bind(addr: &str) -> EngineResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EngineError::transport(format!("bind {addr} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::transport(format!("no local addr: {e}")))?;
        Ok(Server {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` fires, spawning `handler` for each one.
    pub async fn serve<F, Fut>(&self, mut shutdown: mpsc::Receiver<()>, handler: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "accepted connection");
                            let conn = Connection::new(stream, peer_addr);
                            let handler = handler.clone();
                            tokio::spawn(async move { handler(conn).await });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("server shutting down");
                    return;
                }
            }
        }
    }
}
