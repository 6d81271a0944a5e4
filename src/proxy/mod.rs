//! Proxy balancing implementation
//!
//! This module provides:
//! - The balancer core with pluggable selection and feedback hooks
//! - Plain request relay and CONNECT tunneling through upstream proxies
//! - Per-target backoff for failing proxies
//! - Health monitoring with eviction across subscribed balancers

pub mod balancer;
pub mod body;
pub mod forward;
pub mod monitor;
pub mod resolver;
pub mod server;
pub mod source;
pub mod strategy;
pub mod transport;
pub mod tunnel;

pub use balancer::{Balancer, BalancerBuilder};
pub use forward::{ConnectRejectPolicy, ForwardOptions, ProxyMiddleware};
pub use monitor::{Monitor, MonitorConfig, ProbeOutcome};
pub use resolver::TargetResolver;
pub use server::ProxyServer;
pub use source::{Source, Subscription};
pub use strategy::{BackoffStrategy, SelectionContext, Strategy};
pub use transport::ProxyTransport;
pub use tunnel::ConnectMiddleware;
