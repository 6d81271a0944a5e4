//! Proxy Supervisor - load balancing across upstream forward proxies
//!
//! Relays client HTTP(S) traffic through a pool of upstream proxies.
//!
//! ## Features
//!
//! - Least-recently-used selection with a growing per-destination cooldown
//! - Pluggable selection, init and feedback hooks
//! - Plain request relay and CONNECT tunneling
//! - HTTP, SOCKS4, SOCKS4a and SOCKS5 upstream proxies
//! - Periodic health monitoring that evicts dead proxies from every
//!   subscribed balancer

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, SupervisorError};
pub use models::{BackoffState, ProxyEndpoint, ProxyProtocol};
pub use proxy::{
    BackoffStrategy, Balancer, ConnectRejectPolicy, ForwardOptions, Monitor, MonitorConfig,
    ProxyServer, Source, Strategy,
};
