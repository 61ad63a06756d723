//! Ingress listener and request dispatch.
//!
//! One TCP port serves both plain HTTP proxy requests and CONNECT. Every
//! request picks an endpoint from the load balancer, then:
//! - non-CONNECT requests are forwarded through the endpoint and the
//!   upstream response is returned as-is
//! - CONNECT requests open a tunnel through the endpoint, and only after
//!   the endpoint accepts is the client connection taken over
//!
//! Transport failures mark the endpoint unhealthy and answer 502.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::balancer::{LoadBalancer, ProxyEndpoint};
use super::forward::{empty_body, full_body, Forwarder, ProxyBody};
use super::tunnel::{self, TunnelCounters};
use crate::error::IngressError;

/// Default maximum concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default timeout for a forwarded request.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Default dial timeout for CONNECT upstreams.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the ingress listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Whole-request timeout for forwarded requests.
    pub upstream_timeout: Duration,
    /// Dial timeout when opening a tunnel.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Counters for the ingress listener.
#[derive(Debug, Default)]
pub struct IngressStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections refused at the connection cap.
    pub connections_rejected: AtomicU64,
    /// Requests forwarded with an upstream response.
    pub requests_forwarded: AtomicU64,
    /// Tunnels the upstream accepted.
    pub tunnels_established: AtomicU64,
    /// Transport failures and refused CONNECTs.
    pub upstream_failures: AtomicU64,
    /// Requests answered 503.
    pub no_endpoint: AtomicU64,
    /// Tunnel bytes client to upstream.
    pub tunnel_bytes_up: Arc<AtomicU64>,
    /// Tunnel bytes upstream to client.
    pub tunnel_bytes_down: Arc<AtomicU64>,
}

/// Point-in-time copy of [`IngressStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngressStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub requests_forwarded: u64,
    pub tunnels_established: u64,
    pub upstream_failures: u64,
    pub no_endpoint: u64,
    pub tunnel_bytes_up: u64,
    pub tunnel_bytes_down: u64,
}

impl IngressStats {
    pub fn snapshot(&self) -> IngressStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngressStatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            requests_forwarded: load(&self.requests_forwarded),
            tunnels_established: load(&self.tunnels_established),
            upstream_failures: load(&self.upstream_failures),
            no_endpoint: load(&self.no_endpoint),
            tunnel_bytes_up: load(&self.tunnel_bytes_up),
            tunnel_bytes_down: load(&self.tunnel_bytes_down),
        }
    }

    fn tunnel_counters(&self) -> TunnelCounters {
        TunnelCounters {
            to_upstream: Arc::clone(&self.tunnel_bytes_up),
            from_upstream: Arc::clone(&self.tunnel_bytes_down),
        }
    }
}

/// The ingress HTTP proxy listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    balancer: Arc<LoadBalancer>,
    forwarder: Forwarder,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<IngressStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, balancer: Arc<LoadBalancer>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Ingress listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            forwarder: Forwarder::new(config.connect_timeout, config.upstream_timeout),
            listener,
            config,
            balancer,
            stats: Arc::new(IngressStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<IngressStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` flips to true.
    ///
    /// Connections already being served are left to finish on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Ingress listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Ingress listener shutting down");
                        return Ok(());
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            listener.serve_connection(stream).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve HTTP/1 on one client connection, tunnels included.
    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let listener = Arc::clone(&self);
        let service = service_fn(move |req| {
            let listener = Arc::clone(&listener);
            async move { Ok::<_, Infallible>(listener.handle(req).await) }
        });

        let result = http1::Builder::new()
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await;

        if let Err(e) = result {
            debug!(error = %e, "Connection error");
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let endpoint = match self.balancer.select_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.stats.no_endpoint.fetch_add(1, Ordering::Relaxed);
                warn!(method = %req.method(), error = %e, "No endpoint for request");
                return error_response(&IngressError::from(e));
            }
        };

        let result = if req.method() == Method::CONNECT {
            self.tunnel(req, &endpoint).await
        } else {
            self.forward(req, &endpoint).await
        };

        result.unwrap_or_else(|e| error_response(&e))
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        endpoint: &ProxyEndpoint,
    ) -> Result<Response<ProxyBody>, IngressError> {
        match self.forwarder.forward(req, endpoint.address).await {
            Ok(response) => {
                self.stats
                    .requests_forwarded
                    .fetch_add(1, Ordering::Relaxed);
                Ok(response)
            }
            Err(e @ IngressError::UpstreamTransport(_)) => {
                self.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(upstream = %endpoint.address, error = %e, "Forwarding failed");
                self.balancer.mark_unhealthy(endpoint.address).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn tunnel(
        &self,
        mut req: Request<Incoming>,
        endpoint: &ProxyEndpoint,
    ) -> Result<Response<ProxyBody>, IngressError> {
        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| IngressError::BadRequest("CONNECT without host:port".to_string()))?;

        let (upstream, leftover) =
            match tunnel::open(endpoint.address, &target, self.config.connect_timeout).await {
                Ok(opened) => opened,
                Err(e) => {
                    self.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(upstream = %endpoint.address, target = %target, error = %e, "Tunnel setup failed");
                    if matches!(e, IngressError::UpstreamTransport(_)) {
                        self.balancer.mark_unhealthy(endpoint.address).await;
                    }
                    return Err(e);
                }
            };

        let on_upgrade = req
            .extensions_mut()
            .remove::<hyper::upgrade::OnUpgrade>()
            .ok_or(IngressError::HijackUnsupported)?;

        self.stats
            .tunnels_established
            .fetch_add(1, Ordering::Relaxed);
        info!(upstream = %endpoint.address, target = %target, "Tunnel established");

        let counters = self.stats.tunnel_counters();
        tokio::spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        if let Err(e) =
                            tunnel::splice(TokioIo::new(upgraded), upstream, leftover, counters)
                                .await
                        {
                            debug!(error = %e, "Tunnel ended with error");
                        }
                        debug!("Tunnel closed");
                    }
                    Err(e) => warn!(error = %e, "Client connection upgrade failed"),
                }
            }
            .in_current_span(),
        );

        let mut response = Response::new(empty_body());
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }
}

/// Short text response for a failed request.
fn error_response(err: &IngressError) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(err.client_message()));
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
