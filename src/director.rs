//! Per-request rewrite
//!
//! The [`Director`] owns an immutable reference to one listener's routing
//! table. For every proxied request it resolves the inbound host and, on a
//! match, attaches an [`UpstreamTarget`] extension telling the forwarding
//! engine where to send the request. On a miss it leaves the request alone.

use crate::routing::{RoutingTable, Scheme};
use hyper::http::uri::Authority;
use hyper::Request;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the forwarding engine should send a request.
///
/// Only the director inserts this; its absence means "no target".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub authority: Authority,
}

/// Result of directing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// A rule matched and the target was set
    Rewritten {
        from: String,
        to: String,
        scheme: Scheme,
    },
    /// No rule matched this host
    NoMatch { host: String },
    /// A rule matched but its expansion is not a valid authority
    InvalidTarget { host: String, target: String },
    /// The request carried no host at all
    MissingHost,
}

impl RewriteOutcome {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, RewriteOutcome::Rewritten { .. })
    }
}

/// Request director for one listener
#[derive(Debug, Clone)]
pub struct Director {
    table: Arc<RoutingTable>,
}

impl Director {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Resolve the request's host against the routing table and set its upstream target.
    ///
    /// Any target already present on the request is removed first, so a miss
    /// always leaves the request without one.
    pub fn apply<B>(&self, req: &mut Request<B>) -> RewriteOutcome {
        req.extensions_mut().remove::<UpstreamTarget>();

        let host = match request_host(req) {
            Some(host) => host,
            None => {
                warn!("Request without Host header, no route applied");
                return RewriteOutcome::MissingHost;
            }
        };

        let route = match self.table.route(&host) {
            Some(route) => route,
            None => {
                warn!(host = %host, "No routing rule matches host");
                return RewriteOutcome::NoMatch { host };
            }
        };

        let authority = match Authority::try_from(route.host.as_str()) {
            Ok(authority) => authority,
            Err(e) => {
                warn!(host = %host, target = %route.host, rule = route.rule, error = %e, "Rewritten host is not a valid authority");
                return RewriteOutcome::InvalidTarget {
                    host,
                    target: route.host,
                };
            }
        };

        debug!(rule = route.rule, scheme = %route.scheme, "{} -> {}", host, route.host);

        req.extensions_mut().insert(UpstreamTarget {
            scheme: route.scheme,
            authority,
        });

        RewriteOutcome::Rewritten {
            from: host,
            to: route.host,
            scheme: route.scheme,
        }
    }
}

/// The routing key of a request: its Host header, or the URI authority for
/// HTTP/2 requests that carry none. Returned exactly as received.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}
