//! Ingress errors.

use hyper::StatusCode;
use thiserror::Error;

/// Endpoint selection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// The endpoint list is empty.
    #[error("no proxy available")]
    NoProxyAvailable,

    /// Endpoints exist but none is healthy.
    #[error("no healthy proxy available")]
    NoHealthyProxyAvailable,
}

/// Per-request failures. None of these outlive the request that hit them.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    NoEndpoint(#[from] BalancerError),

    /// Dialing or talking to the upstream proxy failed.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// The upstream proxy answered CONNECT with something other than 200.
    #[error("upstream rejected CONNECT: {0}")]
    UpstreamRejectedConnect(String),

    /// The client connection cannot be taken over for a tunnel.
    #[error("client connection cannot be upgraded")]
    HijackUnsupported,

    /// The client request cannot be forwarded as-is.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IngressError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::NoEndpoint(_) => StatusCode::SERVICE_UNAVAILABLE,
            IngressError::UpstreamTransport(_) | IngressError::UpstreamRejectedConnect(_) => {
                StatusCode::BAD_GATEWAY
            }
            IngressError::HijackUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short text body returned to the client.
    pub fn client_message(&self) -> &'static str {
        match self {
            IngressError::NoEndpoint(_) => "No proxy available",
            IngressError::UpstreamTransport(_) => "Proxy request failed",
            IngressError::UpstreamRejectedConnect(_) => "Proxy rejected CONNECT",
            IngressError::HijackUnsupported => "Cannot hijack connection",
            IngressError::BadRequest(_) => "Bad request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(IngressError::NoEndpoint(BalancerError::NoProxyAvailable), 503)]
    #[case(IngressError::NoEndpoint(BalancerError::NoHealthyProxyAvailable), 503)]
    #[case(IngressError::UpstreamTransport("refused".into()), 502)]
    #[case(IngressError::UpstreamRejectedConnect("HTTP/1.1 403 Forbidden".into()), 502)]
    #[case(IngressError::HijackUnsupported, 500)]
    #[case(IngressError::BadRequest("no authority".into()), 400)]
    fn test_status_mapping(#[case] err: IngressError, #[case] status: u16) {
        assert_eq!(err.status().as_u16(), status);
    }
}
