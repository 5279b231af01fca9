//! Hostmux - a host-based reverse-proxy router
//!
//! This library provides a multi-port HTTP(S) front end that:
//! - Picks an upstream per request by matching the Host header against ordered regex rules
//! - Rewrites the upstream host from pattern captures and chooses http or https
//! - Serves static files instead of proxying on listeners configured with a root
//! - Terminates TLS with certificates from a shared cache, generating self-signed ones on demand
//! - Runs every configured listener independently under one supervisor

pub mod config;
pub mod director;
pub mod error;
pub mod forward;
pub mod routing;
pub mod server;
pub mod static_files;
pub mod supervisor;
pub mod tls;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
