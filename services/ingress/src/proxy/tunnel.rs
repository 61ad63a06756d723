//! CONNECT tunneling through an upstream proxy.
//!
//! The upstream handshake happens before the client connection is taken
//! over, so a refused CONNECT can still be answered with a normal HTTP
//! error on the client's connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::IngressError;

/// Largest upstream CONNECT reply header accepted.
const MAX_REPLY_HEADER: usize = 16 * 1024;

/// Buffer size of each copy loop.
const COPY_BUFFER_SIZE: usize = 8192;

/// Dial `upstream` and ask it to CONNECT to `target`.
///
/// Returns the upstream stream positioned after the reply header, plus any
/// tunnel bytes that arrived together with the header.
pub async fn open(
    upstream: SocketAddr,
    target: &str,
    connect_timeout: Duration,
) -> Result<(TcpStream, Bytes), IngressError> {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(upstream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(IngressError::UpstreamTransport(e.to_string())),
        Err(_) => {
            return Err(IngressError::UpstreamTransport(format!(
                "connect to {upstream} timed out"
            )))
        }
    };

    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| IngressError::UpstreamTransport(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(1024);
    let header_end = match timeout(connect_timeout, read_reply_header(&mut stream, &mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(IngressError::UpstreamTransport(format!(
                "{upstream} did not answer CONNECT in time"
            )))
        }
    };

    let header = buf.split_to(header_end);
    let status_line = status_line(&header);
    if !is_success(&status_line) {
        return Err(IngressError::UpstreamRejectedConnect(status_line));
    }

    debug!(upstream = %upstream, target = %target, "Upstream accepted CONNECT");
    Ok((stream, buf.freeze()))
}

/// Read until the reply header is complete. Returns its length in `buf`.
async fn read_reply_header(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<usize, IngressError> {
    loop {
        if let Some(pos) = find_header_end(&buf[..]) {
            return Ok(pos);
        }
        if buf.len() >= MAX_REPLY_HEADER {
            return Err(IngressError::UpstreamRejectedConnect(
                "reply header too large".to_string(),
            ));
        }
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| IngressError::UpstreamTransport(e.to_string()))?;
        if n == 0 {
            return Err(IngressError::UpstreamTransport(
                "upstream closed before replying to CONNECT".to_string(),
            ));
        }
    }
}

/// Offset just past the blank line ending the header, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn status_line(header: &[u8]) -> String {
    let line = header.split(|&b| b == b'\n').next().unwrap_or_default();
    String::from_utf8_lossy(line).trim_end().to_string()
}

fn is_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/")
    )
}

/// Copy direction, for byte accounting.
#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Byte counters a tunnel reports into.
#[derive(Debug, Clone)]
pub struct TunnelCounters {
    pub to_upstream: Arc<AtomicU64>,
    pub from_upstream: Arc<AtomicU64>,
}

impl TunnelCounters {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToUpstream => &self.to_upstream,
            Direction::UpstreamToClient => &self.from_upstream,
        }
    }
}

/// Relay bytes between `client` and `upstream` until either side stops.
///
/// `leftover` is delivered to the client first. When one copy loop ends
/// the other is cancelled and both connections are closed. There is no
/// idle timeout.
pub async fn splice<C>(
    mut client: C,
    upstream: TcpStream,
    leftover: Bytes,
    counters: TunnelCounters,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !leftover.is_empty() {
        client.write_all(&leftover).await?;
        counters
            .counter(Direction::UpstreamToClient)
            .fetch_add(leftover.len() as u64, Ordering::Relaxed);
    }

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut up = tokio::spawn(pump(
        client_read,
        upstream_write,
        counters.clone(),
        Direction::ClientToUpstream,
    ));
    let mut down = tokio::spawn(pump(
        upstream_read,
        client_write,
        counters,
        Direction::UpstreamToClient,
    ));

    tokio::select! {
        _ = &mut up => down.abort(),
        _ = &mut down => up.abort(),
    }

    Ok(())
}

async fn pump<R, W>(mut reader: R, mut writer: W, counters: TunnelCounters, direction: Direction)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                counters
                    .counter(direction)
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(?direction, error = %e, "Tunnel read error");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
