//! Listener orchestration
//!
//! The [`Supervisor`] starts one [`Listener`] per configured server, all
//! sharing a single forwarding engine and, when any server terminates TLS,
//! a single certificate provider. Listeners are independent: a port that
//! fails to bind is logged and the rest keep serving.

use crate::config::CompiledConfig;
use crate::director::Director;
use crate::error::SupervisorError;
use crate::forward::ForwardingEngine;
use crate::server::{Handler, Listener};
use crate::static_files::StaticFiles;
use crate::tls::{self, CertCache, CertificateProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    config: CompiledConfig,
    engine: Arc<ForwardingEngine>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.config.servers.len())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Supervisor {
    /// Prepare the shared engine and TLS acceptor for `config`.
    ///
    /// Without a provider, TLS listeners fall back to self-signed certificates.
    pub fn new(
        config: CompiledConfig,
        provider: Option<Arc<dyn CertificateProvider>>,
    ) -> Result<Self, SupervisorError> {
        let engine = Arc::new(ForwardingEngine::new(config.forward.clone())?);

        let tls_acceptor = if config.needs_tls() {
            let provider = provider.unwrap_or_else(|| {
                warn!("TLS listeners configured without a certificate path, serving self-signed certificates");
                Arc::new(CertCache::self_signed_only()) as Arc<dyn CertificateProvider>
            });
            Some(TlsAcceptor::from(tls::server_config(provider)?))
        } else {
            None
        };

        Ok(Self {
            config,
            engine,
            tls_acceptor,
        })
    }

    pub fn config(&self) -> &CompiledConfig {
        &self.config
    }

    /// Build one listener per server, in configuration order.
    pub fn listeners(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<Listener> {
        self.config
            .servers
            .iter()
            .map(|server| {
                let handler = match &server.static_root {
                    Some(root) => Handler::Static(StaticFiles::new(root)),
                    None => Handler::Proxy {
                        director: Director::new(Arc::clone(&server.rules)),
                        engine: Arc::clone(&self.engine),
                    },
                };

                let addr = SocketAddr::new(self.config.bind, server.port);
                let listener = Listener::new(addr, handler, shutdown_rx.clone());
                match (&self.tls_acceptor, server.tls) {
                    (Some(acceptor), true) => listener.with_tls(acceptor.clone()),
                    _ => listener,
                }
            })
            .collect()
    }

    /// Run every listener until shutdown.
    ///
    /// Returns `Ok` once the shutdown flag is set and all listeners have
    /// stopped and finished their open connections, or [`SupervisorError::AllListenersExited`] if every listener
    /// ended on its own.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let mut tasks = JoinSet::new();

        for listener in self.listeners(shutdown_rx.clone()) {
            tasks.spawn(async move {
                let addr = listener.bind_addr();
                if let Err(e) = listener.run().await {
                    error!(addr = %addr, error = %e, "Listener failed");
                }
                addr
            });
        }

        info!(listeners = tasks.len(), "Supervisor started");

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(addr) => debug!(addr = %addr, "Listener exited"),
                Err(e) => error!(error = %e, "Listener task aborted"),
            }
        }

        if *shutdown_rx.borrow() {
            info!("All listeners stopped");
            Ok(())
        } else {
            Err(SupervisorError::AllListenersExited)
        }
    }
}
