//! Endpoint selection and feedback policies
//!
//! A [`Strategy`] bundles the four hooks a [`Balancer`](crate::proxy::Balancer)
//! consults: which endpoint to use for a request, how to initialize a newly
//! added endpoint, and how to react to a response or a failed attempt.

use std::sync::Arc;

use hyper::{HeaderMap, Method, StatusCode, Uri};

use crate::error::SupervisorError;
use crate::models::ProxyEndpoint;
use crate::proxy::resolver::TargetResolver;

/// Response statuses that count as a healthy answer from an endpoint
pub const GOOD_STATUSES: [u16; 8] = [101, 200, 201, 202, 301, 302, 307, 404];

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What the selection hook knows about the request being routed
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Destination URL (absolute form, or authority form for CONNECT)
    pub target: &'a Uri,
    /// Lowercased destination hostname, the key of the backoff state
    pub host: &'a str,
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

/// Pluggable balancing policy.
///
/// Hooks run while the balancer's pool lock is held, so they must not call
/// back into the balancer.
pub trait Strategy: Send + Sync {
    /// Pick an endpoint among `candidates`, or `None` when nothing is usable
    fn select(
        &self,
        candidates: &[Arc<ProxyEndpoint>],
        ctx: &SelectionContext<'_>,
        resolver: &mut TargetResolver,
    ) -> Option<Arc<ProxyEndpoint>>;

    /// Called once for each endpoint added to the pool
    fn init(&self, endpoint: ProxyEndpoint) -> ProxyEndpoint {
        endpoint
    }

    /// Called once per attempt that produced a response
    fn on_success(
        &self,
        _endpoint: &ProxyEndpoint,
        _target: &str,
        _status: StatusCode,
        _resolver: &mut TargetResolver,
    ) {
    }

    /// Called once per attempt that failed at the transport level
    fn on_failure(
        &self,
        _endpoint: &ProxyEndpoint,
        _target: &str,
        _error: &SupervisorError,
        _resolver: &mut TargetResolver,
    ) {
    }
}

/// Least-recently-used selection with per-target exponential cooldown.
///
/// Endpoints that failed for a target are skipped for `(n + 2)^3` seconds
/// after their n-th consecutive failure, unless every endpoint is cooling
/// down, in which case the least recently used one is returned anyway.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    good_statuses: Vec<u16>,
}

impl BackoffStrategy {
    pub fn new() -> Self {
        Self {
            good_statuses: GOOD_STATUSES.to_vec(),
        }
    }

    /// Replace the allow-list of statuses treated as a good response
    pub fn with_good_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            good_statuses: statuses.into_iter().collect(),
        }
    }

    pub fn is_good(&self, status: StatusCode) -> bool {
        self.good_statuses.contains(&status.as_u16())
    }

    pub fn select_at(
        &self,
        candidates: &[Arc<ProxyEndpoint>],
        target: &str,
        resolver: &mut TargetResolver,
        now: i64,
    ) -> Option<Arc<ProxyEndpoint>> {
        if candidates.is_empty() {
            return None;
        }

        let states = resolver.get(target);
        let state_of =
            |p: &Arc<ProxyEndpoint>| states.get(p.id()).copied().unwrap_or_default();

        let unblocked: Vec<&Arc<ProxyEndpoint>> = candidates
            .iter()
            .filter(|p| state_of(*p).is_unblocked(now))
            .collect();

        let usable = if unblocked.is_empty() {
            candidates.iter().collect()
        } else {
            unblocked
        };

        // min_by_key keeps the first of equal keys
        let chosen = usable
            .into_iter()
            .min_by_key(|p| state_of(*p).used_at)?
            .clone();

        states
            .entry(chosen.id().to_string())
            .or_default()
            .mark_used(now);

        Some(chosen)
    }

    pub fn on_success_at(
        &self,
        endpoint: &ProxyEndpoint,
        target: &str,
        status: StatusCode,
        resolver: &mut TargetResolver,
        now: i64,
    ) {
        if self.is_good(status) {
            resolver.update(target, endpoint.id(), |s| s.reset());
        } else {
            resolver.update(target, endpoint.id(), |s| s.block(now));
        }
    }

    pub fn on_failure_at(
        &self,
        endpoint: &ProxyEndpoint,
        target: &str,
        resolver: &mut TargetResolver,
        now: i64,
    ) {
        resolver.update(target, endpoint.id(), |s| s.block(now));
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for BackoffStrategy {
    fn select(
        &self,
        candidates: &[Arc<ProxyEndpoint>],
        ctx: &SelectionContext<'_>,
        resolver: &mut TargetResolver,
    ) -> Option<Arc<ProxyEndpoint>> {
        self.select_at(candidates, ctx.host, resolver, now_ms())
    }

    fn on_success(
        &self,
        endpoint: &ProxyEndpoint,
        target: &str,
        status: StatusCode,
        resolver: &mut TargetResolver,
    ) {
        self.on_success_at(endpoint, target, status, resolver, now_ms());
    }

    fn on_failure(
        &self,
        endpoint: &ProxyEndpoint,
        target: &str,
        _error: &SupervisorError,
        resolver: &mut TargetResolver,
    ) {
        self.on_failure_at(endpoint, target, resolver, now_ms());
    }
}
