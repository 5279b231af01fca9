//! Per-port listener: accept loop, optional TLS termination and request dispatch

use crate::director::{Director, RewriteOutcome};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ClientInfo, ForwardingEngine};
use crate::static_files::StaticFiles;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// What a listener does with each request
#[derive(Debug)]
pub enum Handler {
    /// Rewrite by host and forward upstream
    Proxy {
        director: Director,
        engine: Arc<ForwardingEngine>,
    },
    /// Serve files from a directory
    Static(StaticFiles),
}

impl Handler {
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client: ClientInfo,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self {
            Handler::Static(files) => files.serve(req).await,
            Handler::Proxy { director, engine } => {
                if director.apply(&mut req) == RewriteOutcome::MissingHost {
                    return json_error_response(ProxyErrorCode::MissingHostHeader, "Missing Host header");
                }
                engine.forward(req, client).await
            }
        }
    }
}

/// One bound port
pub struct Listener {
    bind_addr: SocketAddr,
    handler: Arc<Handler>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(bind_addr: SocketAddr, handler: Handler, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
            tls_acceptor: None,
            shutdown_rx,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound socket until shutdown.
    ///
    /// Returns once the accept loop has stopped and every open connection
    /// has finished its in-flight requests.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        let mode = match self.handler.as_ref() {
            Handler::Proxy { .. } => "proxy",
            Handler::Static(_) => "static",
        };
        info!(addr = %local, protocol, mode, "Listener started");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let mut conn_shutdown = self.shutdown_rx.clone();

                            connections.spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    let handshake = tokio::select! {
                                        result = acceptor.accept(stream) => result,
                                        _ = wait_for_shutdown(&mut conn_shutdown) => return,
                                    };
                                    match handshake {
                                        Ok(tls_stream) => {
                                            let client = ClientInfo { addr, is_tls: true };
                                            if let Err(e) = handle_connection(tls_stream, handler, client, conn_shutdown).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else {
                                    let client = ClientInfo { addr, is_tls: false };
                                    if let Err(e) = handle_connection(stream, handler, client, conn_shutdown).await {
                                        debug!(addr = %addr, error = %e, "Connection error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(addr = %local, error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!(addr = %local, open = connections.len(), "Listener shutting down");
                    break;
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        debug!(addr = %local, "Listener drained");

        Ok(())
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn handle_connection<S>(
    stream: S,
    handler: Arc<Handler>,
    client: ClientInfo,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req, client).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
    }

    Ok(())
}
