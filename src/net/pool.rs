use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::core::backend::Backend;
use crate::core::relay::{Client, ConnectionPool};

/// A pooled TCP connection to a single backend. `write_line`/`flush` are the
/// only operations the relay forwarding path needs (spec §4.8).
pub struct PooledTcpClient {
    stream: BufWriter<TcpStream>,
}

impl Client for PooledTcpClient {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }
}

/// A minimal per-backend pool of idle `PooledTcpClient`s (spec §4.8): borrow
/// pops an idle connection or dials a fresh one, give-back pushes it back for
/// reuse. Not a design-bearing part of the resolver itself — any pool
/// satisfying `ConnectionPool` works with `RelayHandler`.
pub struct TcpConnectionPool {
    idle: Mutex<HashMap<String, Vec<PooledTcpClient>>>,
}

impl TcpConnectionPool {
    pub fn new() -> Self {
        TcpConnectionPool { idle: Mutex::new(HashMap::new()) }
    }
}

impl Default for TcpConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool<PooledTcpClient> for TcpConnectionPool {
    async fn borrow(&self, backend: &Arc<Backend>) -> std::io::Result<PooledTcpClient> {
        let pooled = {
            let mut idle = self.idle.lock().unwrap();
            idle.get_mut(&backend.addr()).and_then(|v| v.pop())
        };
        if let Some(client) = pooled {
            return Ok(client);
        }
        let stream = TcpStream::connect(backend.addr()).await?;
        Ok(PooledTcpClient { stream: BufWriter::new(stream) })
    }

    async fn give_back(&self, backend: &Arc<Backend>, client: PooledTcpClient) {
        let mut idle = self.idle.lock().unwrap();
        idle.entry(backend.addr()).or_default().push(client);
    }
}
