//! Upstream forwarding engine
//!
//! Sends directed requests to their upstream through a pooled hyper client.
//! The engine never decides *where* a request goes: it reads the
//! [`UpstreamTarget`] set by the director and, when there is none, answers
//! `502 NO_ROUTE` itself.

use crate::config::ForwardConfig;
use crate::director::UpstreamTarget;
use crate::error::{json_error_response, ForwardError, ProxyErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe one connection and must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Information about the inbound connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub is_tls: bool,
}

/// Pooled HTTP/HTTPS client forwarding directed requests upstream
pub struct ForwardingEngine<B = hyper::body::Incoming> {
    client: Client<HttpsConnector<HttpConnector>, B>,
    config: ForwardConfig,
}

impl<B> std::fmt::Debug for ForwardingEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl<B> ForwardingEngine<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Create a new engine with its own connection pool
    pub fn new(config: ForwardConfig) -> Result<Self, ForwardError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(provider)?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Forwarding engine initialized"
        );

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// Forward a directed request and return the upstream response.
    ///
    /// Failures are turned into JSON error responses; this never fails.
    pub async fn forward(
        &self,
        req: Request<B>,
        client: ClientInfo,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let target = match req.extensions().get::<UpstreamTarget>() {
            Some(target) => target.clone(),
            None => return json_error_response(ProxyErrorCode::NoRoute, "No route for requested host"),
        };

        let upstream_req = match prepare_request(req, &target, client) {
            Ok(req) => req,
            Err(e) => {
                error!(error = %e, "Failed to build upstream request");
                return json_error_response(ProxyErrorCode::InternalError, "Failed to build upstream request");
            }
        };

        let upstream = target.authority.clone();
        let result = tokio::time::timeout(self.config.request_timeout, self.client.request(upstream_req)).await;

        match result {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                error!(upstream = %upstream, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to upstream")
            }
            Err(_) => {
                warn!(
                    upstream = %upstream,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Upstream request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.config.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Rebuild a request for its upstream: absolute URI, forwarding headers,
/// hop-by-hop headers removed. The inbound Host header is preserved.
pub fn prepare_request<B>(
    req: Request<B>,
    target: &UpstreamTarget,
    client: ClientInfo,
) -> Result<Request<B>, ForwardError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri_text = format!("{}://{}{}", target.scheme, target.authority, path_and_query);
    let uri: Uri = uri_text.parse().map_err(|e: hyper::http::uri::InvalidUri| ForwardError::InvalidUri {
        uri: uri_text.clone(),
        message: e.to_string(),
    })?;

    // HTTP/2 requests carry their host in the URI only
    if !parts.headers.contains_key(hyper::header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(hyper::header::HOST, value);
            }
        }
    }

    strip_hop_by_hop(&mut parts.headers);

    let headers = &mut parts.headers;

    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    // X-Forwarded-* are replaced, never appended to
    if let Ok(value) = HeaderValue::from_str(&client.addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if client.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    parts.uri = uri;
    parts.version = hyper::Version::HTTP_11;

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any named by the Connection header
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::{Director, RewriteOutcome};
    use crate::routing::{Pattern, RoutingTable, Rule, Scheme};
    use hyper::http::uri::Authority;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    /// Counts events emitted by this crate
    struct EventCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if event.metadata().target().starts_with(env!("CARGO_PKG_NAME")) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn client_info() -> ClientInfo {
        ClientInfo {
            addr: "192.0.2.7:51000".parse().unwrap(),
            is_tls: false,
        }
    }

    fn target(scheme: Scheme, authority: &'static str) -> UpstreamTarget {
        UpstreamTarget {
            scheme,
            authority: Authority::from_static(authority),
        }
    }

    #[test]
    fn test_prepare_request_builds_absolute_uri() {
        let req = Request::builder()
            .uri("/api/items?page=2")
            .header(hyper::header::HOST, "a.test")
            .body(())
            .unwrap();

        let out = prepare_request(req, &target(Scheme::Https, "b.internal:8443"), client_info()).unwrap();

        assert_eq!(out.uri(), "https://b.internal:8443/api/items?page=2");
        assert_eq!(out.headers().get(hyper::header::HOST).unwrap(), "a.test");
        assert_eq!(out.headers().get(X_FORWARDED_HOST).unwrap(), "a.test");
        assert_eq!(out.headers().get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(out.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
        assert!(out.headers().contains_key(X_REQUEST_ID));
    }

    #[test]
    fn test_prepare_request_overwrites_spoofed_forwarding_headers() {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "a.test")
            .header(X_FORWARDED_FOR, "10.9.9.9")
            .header(X_FORWARDED_PROTO, "https")
            .header(X_REQUEST_ID, "abc-123")
            .body(())
            .unwrap();

        let out = prepare_request(req, &target(Scheme::Http, "b.test"), client_info()).unwrap();

        assert_eq!(out.headers().get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(out.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(out.headers().get(X_REQUEST_ID).unwrap(), "abc-123");
    }

    #[test]
    fn test_prepare_request_strips_hop_by_hop() {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "a.test")
            .header(hyper::header::CONNECTION, "keep-alive, x-private")
            .header("keep-alive", "timeout=5")
            .header("x-private", "secret")
            .header("x-public", "ok")
            .body(())
            .unwrap();

        let out = prepare_request(req, &target(Scheme::Http, "b.test"), client_info()).unwrap();

        assert!(!out.headers().contains_key(hyper::header::CONNECTION));
        assert!(!out.headers().contains_key("keep-alive"));
        assert!(!out.headers().contains_key("x-private"));
        assert_eq!(out.headers().get("x-public").unwrap(), "ok");
    }

    #[test]
    fn test_prepare_request_fills_host_from_authority() {
        let req = Request::builder()
            .uri("https://a.test/x")
            .body(())
            .unwrap();

        let out = prepare_request(req, &target(Scheme::Http, "b.test"), client_info()).unwrap();
        assert_eq!(out.uri(), "http://b.test/x");
        assert_eq!(out.headers().get(hyper::header::HOST).unwrap(), "a.test");
    }

    #[tokio::test]
    async fn test_forward_without_target_is_no_route() {
        let engine: ForwardingEngine<http_body_util::Empty<Bytes>> =
            ForwardingEngine::new(ForwardConfig::default()).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "c.test")
            .body(http_body_util::Empty::new())
            .unwrap();

        let response = engine.forward(req, client_info()).await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NO_ROUTE");
    }

    #[tokio::test]
    async fn test_routing_miss_logs_once() {
        let engine: ForwardingEngine<http_body_util::Empty<Bytes>> =
            ForwardingEngine::new(ForwardConfig::default()).unwrap();
        let director = Director::new(Arc::new(RoutingTable::new(vec![Rule::new(
            Pattern::compile(r"^a\.test$").unwrap(),
            "b.test",
            None,
        )])));

        let events = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(EventCounter(Arc::clone(&events)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "c.test")
            .body(http_body_util::Empty::new())
            .unwrap();
        assert!(matches!(director.apply(&mut req), RewriteOutcome::NoMatch { .. }));
        let response = engine.forward(req, client_info()).await;

        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NO_ROUTE");
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forward_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let engine: ForwardingEngine<http_body_util::Empty<Bytes>> = ForwardingEngine::new(ForwardConfig {
            request_timeout: Duration::from_secs(5),
            ..ForwardConfig::default()
        })
        .unwrap();

        let mut req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "a.test")
            .body(http_body_util::Empty::new())
            .unwrap();
        req.extensions_mut().insert(UpstreamTarget {
            scheme: Scheme::Http,
            authority: Authority::try_from(format!("127.0.0.1:{}", port).as_str()).unwrap(),
        });

        let response = engine.forward(req, client_info()).await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }
}
