use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

use crate::core::relay::{Client, ConnectionPool, RelayHandler, RelayRequest};
use crate::core::resolver::Resolver;

/// Parses one inbound protocol line into the shape the resolver/relay expect
/// (spec §6's `Request` variant). The framing layer itself is out of scope;
/// this is the minimal reader needed to produce those values from a socket.
///
/// A line of the form `put <metric> ...` is a metric (ingest) request; the
/// metric name is the first whitespace-separated token after `put`. Anything
/// else (including the literal `version` line) is a non-metric request.
pub fn parse_line(line: &str) -> Option<RelayRequest> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next().unwrap_or("");
    if verb == "put" {
        if let Some(metric_name) = parts.next() {
            return Some(RelayRequest::Metric { metric_name: metric_name.to_string(), line: line.to_string() });
        }
    }
    Some(RelayRequest::Other)
}

/// Wraps the client-facing half of an accepted connection so it satisfies the
/// relay's `Client` contract; used both to borrow nothing (the edge never
/// goes through the pool) and, on a failure, to write the error line back.
struct EdgeClient {
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl Client for EdgeClient {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}

/// Accepts connections on `listener` and, for each one, reads newline-
/// delimited protocol lines and forwards each through `handler` until the
/// peer disconnects. One task per connection; a connection's failure never
/// affects another.
pub async fn serve<P, C>(listener: TcpListener, handler: Arc<RelayHandler<P, C>>)
where
    P: ConnectionPool<C> + 'static,
    C: Client + 'static,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept error: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &handler).await {
                debug!("connection {} closed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection<P, C>(stream: TcpStream, handler: &RelayHandler<P, C>) -> std::io::Result<()>
where
    P: ConnectionPool<C>,
    C: Client,
{
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut reply = EdgeClient { writer: BufWriter::new(write_half) };

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(()); // peer closed
        }

        let request = match parse_line(&line) {
            Some(request) => request,
            None => continue, // blank line, nothing to forward
        };

        handler.handle(&request, &mut reply).await;
    }
}

/// Binds the ingest-facing listener, logging the bound address the way the
/// teacher's acceptor setup logs its own listeners.
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening for ingest traffic on {}", addr);
    Ok(listener)
}
