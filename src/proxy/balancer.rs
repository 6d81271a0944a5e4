//! Balancer core
//!
//! Owns the endpoint pool and the per-target backoff state, exposes the
//! pluggable hooks and builds the forwarding middlewares.

use std::sync::Arc;

use arc_swap::ArcSwap;
use hyper::StatusCode;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::models::{BackoffState, ProxyEndpoint};
use crate::proxy::forward::{ConnectRejectPolicy, ForwardOptions, ProxyMiddleware};
use crate::proxy::resolver::TargetResolver;
use crate::proxy::source::{Source, Subscription};
use crate::proxy::strategy::{BackoffStrategy, SelectionContext, Strategy};
use crate::proxy::transport::ProxyTransport;
use crate::proxy::tunnel::ConnectMiddleware;

/// Default bound on idle keep-alive connections to upstream proxies
pub const DEFAULT_MAX_IDLE_SOCKETS: usize = 1024;

/// Selection hook
pub type NextHook = dyn Fn(
        &[Arc<ProxyEndpoint>],
        &SelectionContext<'_>,
        &mut TargetResolver,
    ) -> Option<Arc<ProxyEndpoint>>
    + Send
    + Sync;

/// Initialization hook for newly added endpoints
pub type AddHook = dyn Fn(ProxyEndpoint) -> ProxyEndpoint + Send + Sync;

/// Feedback hook for attempts that produced a response
pub type ResponseHook = dyn Fn(&ProxyEndpoint, &str, StatusCode, &mut TargetResolver) + Send + Sync;

/// Feedback hook for failed attempts
pub type ErrorHook =
    dyn Fn(&ProxyEndpoint, &str, &SupervisorError, &mut TargetResolver) + Send + Sync;

#[derive(Clone)]
struct Hooks {
    next: Option<Arc<NextHook>>,
    add: Arc<AddHook>,
    response: Arc<ResponseHook>,
    error: Arc<ErrorHook>,
}

impl Hooks {
    fn bare() -> Self {
        Self {
            next: None,
            add: Arc::new(|endpoint: ProxyEndpoint| endpoint),
            response: Arc::new(
                |_: &ProxyEndpoint, _: &str, _: StatusCode, _: &mut TargetResolver| {},
            ),
            error: Arc::new(
                |_: &ProxyEndpoint, _: &str, _: &SupervisorError, _: &mut TargetResolver| {},
            ),
        }
    }

    fn from_strategy(strategy: Arc<dyn Strategy>) -> Self {
        let select = strategy.clone();
        let init = strategy.clone();
        let success = strategy.clone();
        let failure = strategy;

        Self {
            next: Some(Arc::new(
                move |candidates: &[Arc<ProxyEndpoint>],
                      ctx: &SelectionContext<'_>,
                      resolver: &mut TargetResolver| {
                    select.select(candidates, ctx, resolver)
                },
            )),
            add: Arc::new(move |endpoint: ProxyEndpoint| init.init(endpoint)),
            response: Arc::new(
                move |endpoint: &ProxyEndpoint,
                      target: &str,
                      status: StatusCode,
                      resolver: &mut TargetResolver| {
                    success.on_success(endpoint, target, status, resolver)
                },
            ),
            error: Arc::new(
                move |endpoint: &ProxyEndpoint,
                      target: &str,
                      error: &SupervisorError,
                      resolver: &mut TargetResolver| {
                    failure.on_failure(endpoint, target, error, resolver)
                },
            ),
        }
    }
}

#[derive(Default)]
struct PoolState {
    proxies: Vec<Arc<ProxyEndpoint>>,
    resolver: TargetResolver,
}

struct BalancerInner {
    state: Mutex<PoolState>,
    hooks: ArcSwap<Hooks>,
    transport: ProxyTransport,
    infer_socks: bool,
}

/// A pool of upstream proxies with a pluggable selection policy.
///
/// Cloning is cheap and every clone shares the same pool, backoff state and
/// hooks. Hooks are invoked while the pool lock is held, so selection plus
/// its bookkeeping is atomic with respect to concurrent requests.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

impl Balancer {
    /// Balancer without a selection hook; install one with [`Balancer::on_next`]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Balancer running the default [`BackoffStrategy`]
    pub fn with_backoff() -> Self {
        Self::builder().strategy(BackoffStrategy::new()).build()
    }

    pub fn with_strategy<S: Strategy + 'static>(strategy: S) -> Self {
        Self::builder().strategy(strategy).build()
    }

    pub fn builder() -> BalancerBuilder {
        BalancerBuilder::new()
    }

    /// Add endpoints by address. An existing identity takes the new scheme
    /// and credentials but keeps what `on_add` attached to it.
    /// Unparseable addresses are logged and skipped.
    pub fn add<I, S>(&self, addresses: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for address in addresses {
            let address = address.as_ref();
            match ProxyEndpoint::parse_with(address, self.inner.infer_socks) {
                Ok(endpoint) => self.add_endpoint(endpoint),
                Err(e) => warn!("Skipping proxy {}: {}", address, e),
            }
        }
        self
    }

    /// Insert or update a parsed endpoint
    pub fn add_endpoint(&self, endpoint: ProxyEndpoint) {
        let hooks = self.inner.hooks.load();
        let mut state = self.inner.state.lock();

        let position = state.proxies.iter().position(|p| p.id() == endpoint.id());
        match position {
            Some(index) => {
                debug!("Updating proxy {}", endpoint);
                self.inner.transport.forget(endpoint.id());
                let mut updated = ProxyEndpoint::clone(&state.proxies[index]);
                updated.update_from(endpoint);
                state.proxies[index] = Arc::new(updated);
            }
            None => {
                let endpoint = (hooks.add)(endpoint);
                debug!("Adding proxy {}", endpoint);
                state.proxies.push(Arc::new(endpoint));
            }
        }
    }

    /// Remove endpoints by address; addresses not in the pool are ignored
    pub fn remove<I, S>(&self, addresses: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = addresses
            .into_iter()
            .filter_map(|address| {
                ProxyEndpoint::parse_with(address.as_ref(), self.inner.infer_socks).ok()
            })
            .map(|endpoint| endpoint.id().to_string())
            .collect();

        self.remove_ids(&ids);
        self
    }

    pub fn remove_endpoints(&self, endpoints: &[Arc<ProxyEndpoint>]) -> &Self {
        let ids: Vec<String> = endpoints.iter().map(|e| e.id().to_string()).collect();
        self.remove_ids(&ids);
        self
    }

    fn remove_ids(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }

        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.proxies.len();
            state.proxies.retain(|p| !ids.iter().any(|id| id == p.id()));
            before - state.proxies.len()
        };

        for id in ids {
            self.inner.transport.forget(id);
        }

        if removed > 0 {
            info!(removed, "Removed proxies from pool");
        }
    }

    /// Register this balancer as a listener of `source`
    pub fn subscribe<S: AsRef<Source>>(&self, source: &S) -> Subscription {
        source.as_ref().add_listener(self)
    }

    /// Install the selection hook
    pub fn on_next<F>(&self, f: F) -> &Self
    where
        F: Fn(
                &[Arc<ProxyEndpoint>],
                &SelectionContext<'_>,
                &mut TargetResolver,
            ) -> Option<Arc<ProxyEndpoint>>
            + Send
            + Sync
            + 'static,
    {
        let f: Arc<NextHook> = Arc::new(f);
        self.inner.hooks.rcu(|hooks| Hooks {
            next: Some(f.clone()),
            ..Hooks::clone(hooks)
        });
        self
    }

    /// Install the hook run once for each newly added endpoint
    pub fn on_add<F>(&self, f: F) -> &Self
    where
        F: Fn(ProxyEndpoint) -> ProxyEndpoint + Send + Sync + 'static,
    {
        let f: Arc<AddHook> = Arc::new(f);
        self.inner.hooks.rcu(|hooks| Hooks {
            add: f.clone(),
            ..Hooks::clone(hooks)
        });
        self
    }

    /// Install the success feedback hook
    pub fn on_response<F>(&self, f: F) -> &Self
    where
        F: Fn(&ProxyEndpoint, &str, StatusCode, &mut TargetResolver) + Send + Sync + 'static,
    {
        let f: Arc<ResponseHook> = Arc::new(f);
        self.inner.hooks.rcu(|hooks| Hooks {
            response: f.clone(),
            ..Hooks::clone(hooks)
        });
        self
    }

    /// Install the failure feedback hook
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: Fn(&ProxyEndpoint, &str, &SupervisorError, &mut TargetResolver) + Send + Sync + 'static,
    {
        let f: Arc<ErrorHook> = Arc::new(f);
        self.inner.hooks.rcu(|hooks| Hooks {
            error: f.clone(),
            ..Hooks::clone(hooks)
        });
        self
    }

    /// Run the selection hook against the current pool
    pub fn select(&self, ctx: &SelectionContext<'_>) -> Result<Option<Arc<ProxyEndpoint>>> {
        let hooks = self.inner.hooks.load();
        let next = hooks.next.as_ref().ok_or(SupervisorError::NoNextProvided)?;

        let mut state = self.inner.state.lock();
        let PoolState { proxies, resolver } = &mut *state;
        Ok(next(proxies, ctx, resolver))
    }

    /// Feed a response status for `target` back to the policy
    pub fn report_response(&self, endpoint: &ProxyEndpoint, target: &str, status: StatusCode) {
        let hooks = self.inner.hooks.load();
        let mut state = self.inner.state.lock();
        (hooks.response)(endpoint, target, status, &mut state.resolver);
    }

    /// Feed a failed attempt for `target` back to the policy
    pub fn report_error(&self, endpoint: &ProxyEndpoint, target: &str, error: &SupervisorError) {
        let hooks = self.inner.hooks.load();
        let mut state = self.inner.state.lock();
        (hooks.error)(endpoint, target, error, &mut state.resolver);
    }

    /// Feed a non-2xx CONNECT reply back according to `policy`
    pub fn report_rejection(
        &self,
        endpoint: &ProxyEndpoint,
        target: &str,
        status: StatusCode,
        reason: &str,
        policy: ConnectRejectPolicy,
    ) {
        match policy {
            ConnectRejectPolicy::Status => self.report_response(endpoint, target, status),
            ConnectRejectPolicy::Error => {
                let error = SupervisorError::ConnectNotOk {
                    status: status.as_u16(),
                    reason: reason.to_string(),
                };
                self.report_error(endpoint, target, &error);
            }
            ConnectRejectPolicy::Ignore => {}
        }
    }

    /// Snapshot of the pool
    pub fn endpoints(&self) -> Vec<Arc<ProxyEndpoint>> {
        self.inner.state.lock().proxies.clone()
    }

    /// Whether an endpoint with the identity of `address` is in the pool
    pub fn contains(&self, address: &str) -> bool {
        let Ok(endpoint) = ProxyEndpoint::parse_with(address, self.inner.infer_socks) else {
            return false;
        };
        self.inner
            .state
            .lock()
            .proxies
            .iter()
            .any(|p| p.id() == endpoint.id())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backoff state of endpoint `proxy_id` for `target`
    pub fn backoff(&self, target: &str, proxy_id: &str) -> BackoffState {
        self.inner.state.lock().resolver.state(target, proxy_id)
    }

    /// Number of distinct targets with recorded backoff state
    pub fn tracked_targets(&self) -> usize {
        self.inner.state.lock().resolver.target_count()
    }

    /// Plain request relay middleware
    pub fn proxy(&self, options: ForwardOptions) -> ProxyMiddleware {
        ProxyMiddleware::new(self.clone(), options)
    }

    /// CONNECT tunnel middleware
    pub fn connect(&self, options: ForwardOptions) -> ConnectMiddleware {
        ConnectMiddleware::new(self.clone(), options)
    }

    /// Idle keep-alive connections to upstream proxies cached for reuse
    pub fn idle_connections(&self) -> usize {
        self.inner.transport.idle_count()
    }

    pub(crate) fn transport(&self) -> &ProxyTransport {
        &self.inner.transport
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("proxies", &self.len())
            .finish_non_exhaustive()
    }
}

/// Builder for creating a balancer
pub struct BalancerBuilder {
    strategy: Option<Arc<dyn Strategy>>,
    max_idle_sockets: usize,
    infer_socks: bool,
}

impl BalancerBuilder {
    pub fn new() -> Self {
        Self {
            strategy: None,
            max_idle_sockets: DEFAULT_MAX_IDLE_SOCKETS,
            infer_socks: false,
        }
    }

    pub fn strategy<S: Strategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn max_idle_sockets(mut self, max_idle_sockets: usize) -> Self {
        self.max_idle_sockets = max_idle_sockets;
        self
    }

    /// Treat scheme-less addresses on port 1080 as SOCKS5 proxies
    pub fn infer_socks(mut self, infer_socks: bool) -> Self {
        self.infer_socks = infer_socks;
        self
    }

    pub fn build(self) -> Balancer {
        let hooks = match self.strategy {
            Some(strategy) => Hooks::from_strategy(strategy),
            None => Hooks::bare(),
        };

        Balancer {
            inner: Arc::new(BalancerInner {
                state: Mutex::new(PoolState::default()),
                hooks: ArcSwap::from_pointee(hooks),
                transport: ProxyTransport::new(self.max_idle_sockets),
                infer_socks: self.infer_socks,
            }),
        }
    }
}

impl Default for BalancerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
