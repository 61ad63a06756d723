//! Plain HTTP forwarding through an upstream proxy.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::IngressError;

/// Response body handed back to the client.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Wrap a fixed payload as a [`ProxyBody`].
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty [`ProxyBody`].
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Resolve the URL a proxied request asks for.
///
/// Absolute-form targets are used as-is; origin-form targets are rebuilt
/// from the `Host` header.
pub fn target_url<B>(req: &Request<B>) -> Result<String, IngressError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| IngressError::BadRequest("request has no host".to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Ok(format!("http://{host}{path}"))
}

/// Rewrite `req` into the absolute form an upstream proxy expects.
///
/// Method, headers and body are left exactly as the client sent them.
pub fn proxy_request<B>(req: Request<B>) -> Result<Request<B>, IngressError> {
    let url = target_url(&req)?;
    let uri: Uri = url
        .parse()
        .map_err(|e| IngressError::BadRequest(format!("invalid target {url}: {e}")))?;
    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    Ok(Request::from_parts(parts, body))
}

/// Sends requests through the selected upstream proxy.
///
/// Each request gets its own upstream connection, so nothing is kept per
/// endpoint between requests. The request body is streamed to the
/// upstream as it arrives from the client.
pub struct Forwarder {
    connect_timeout: Duration,
    timeout: Duration,
}

impl Forwarder {
    /// `timeout` bounds the wait for the upstream's response header.
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Self {
        Self {
            connect_timeout,
            timeout,
        }
    }

    async fn connect(
        &self,
        upstream: SocketAddr,
    ) -> Result<http1::SendRequest<Incoming>, IngressError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(upstream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(IngressError::UpstreamTransport(e.to_string())),
            Err(_) => {
                return Err(IngressError::UpstreamTransport(format!(
                    "connect to {upstream} timed out"
                )))
            }
        };

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| IngressError::UpstreamTransport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(upstream = %upstream, error = %e, "Upstream connection ended with error");
            }
        });
        Ok(sender)
    }

    /// Forward `req` via `upstream` and return the upstream's response
    /// unchanged, whatever its status.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        upstream: SocketAddr,
    ) -> Result<Response<ProxyBody>, IngressError> {
        let req = proxy_request(req)?;
        debug!(method = %req.method(), url = %req.uri(), upstream = %upstream, "Forwarding request");

        let mut sender = self.connect(upstream).await?;
        let response = match timeout(self.timeout, sender.send_request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(IngressError::UpstreamTransport(e.to_string())),
            Err(_) => {
                return Err(IngressError::UpstreamTransport(format!(
                    "{upstream} did not respond in time"
                )))
            }
        };

        Ok(response.map(|body| body.map_err(io::Error::other).boxed_unsync()))
    }
}
