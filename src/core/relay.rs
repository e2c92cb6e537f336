use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::Backend;
use crate::core::resolver::Resolver;

/// The shape of an incoming request once the (out-of-scope) framing layer
/// has parsed it (spec §6).
#[derive(Debug, Clone)]
pub enum RelayRequest {
    Metric { metric_name: String, line: String },
    Other,
}

/// Anything the relay can write a line to and flush: the pooled backend
/// client, and the channel the request arrived on (spec §6's `Client`
/// contract, reused for both roles since both only need `write`/`flush`).
pub trait Client: Send {
    fn write_line(&mut self, line: &str) -> impl std::future::Future<Output = std::io::Result<()>> + Send;
    fn flush(&mut self) -> impl std::future::Future<Output = std::io::Result<()>> + Send;
}

/// The external outbound connection pool (spec §6, §4.8). Borrow/return are
/// keyed by Backend; the pool's internals carry no invariants of their own.
pub trait ConnectionPool<C: Client>: Send + Sync {
    fn borrow(&self, backend: &Arc<Backend>) -> impl std::future::Future<Output = std::io::Result<C>> + Send;
    fn give_back(&self, backend: &Arc<Backend>, client: C) -> impl std::future::Future<Output = ()> + Send;
}

/// Per-request binding from a parsed request to `(Backend, PooledClient)`,
/// forwarding a single line, and returning the client with retry/backoff on
/// pool-borrow failure (spec §4.5).
pub struct RelayHandler<P, C>
where
    P: ConnectionPool<C>,
    C: Client,
{
    resolver: Arc<Resolver>,
    pool: Arc<P>,
    _client: std::marker::PhantomData<C>,
}

impl<P, C> RelayHandler<P, C>
where
    P: ConnectionPool<C>,
    C: Client,
{
    pub fn new(resolver: Arc<Resolver>, pool: Arc<P>) -> Self {
        RelayHandler { resolver, pool, _client: std::marker::PhantomData }
    }

    /// Escalating backoff after a borrow failure: 500ms for the first 9
    /// failures, 60s thereafter. The retry loop is intentionally unbounded
    /// (spec: "a deliberate backpressure mechanism — it stalls the upstream
    /// rather than dropping requests"); callers that want a bound cancel the
    /// enclosing task instead.
    fn backoff_delay(failures: u32) -> Duration {
        if failures <= 9 {
            Duration::from_millis(500)
        } else {
            Duration::from_secs(60)
        }
    }

    pub async fn handle<R: Client>(&self, request: &RelayRequest, reply: &mut R) {
        let line: &str = match request {
            RelayRequest::Metric { line, .. } => line.as_str(),
            RelayRequest::Other => "version",
        };

        let mut failures: u32 = 0;
        let (backend, mut client) = loop {
            let backend = match request {
                RelayRequest::Metric { metric_name, .. } => self.resolver.get_host_port_key_ingest(metric_name),
                RelayRequest::Other => self.resolver.get_host_port_key(None),
            };

            let backend = match backend {
                Some(b) => b,
                None => {
                    // No-backend-up is treated identically to a borrow
                    // failure: back off and re-resolve.
                    failures += 1;
                    tokio::time::sleep(Self::backoff_delay(failures)).await;
                    continue;
                }
            };

            match self.pool.borrow(&backend).await {
                Ok(client) => break (backend, client),
                Err(e) => {
                    log::warn!("borrow failed for {}: {}", backend.addr(), e);
                    failures += 1;
                    tokio::time::sleep(Self::backoff_delay(failures)).await;
                }
            }
        };

        let write_result = async {
            client.write_line(line).await?;
            client.flush().await
        }
        .await;

        self.pool.give_back(&backend, client).await;

        if let Err(e) = write_result {
            let _ = reply.write_line(&format!("Error storing put metric: {}", e)).await;
            let _ = reply.flush().await;
        }
    }
}
