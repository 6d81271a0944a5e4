//! Health monitoring for upstream proxies
//!
//! Periodically probes every endpoint known to the subscribed balancers and
//! evicts the ones that fail from all of them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use hyper::header::USER_AGENT;
use hyper::{Method, Request, StatusCode, Uri};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SupervisorError};
use crate::models::ProxyEndpoint;
use crate::proxy::balancer::Balancer;
use crate::proxy::source::{Source, Subscription};
use crate::proxy::transport::{empty_body, ProxyBody, ProxyTransport};

/// Default time between two checks
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300_000);

/// Default deadline for one probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// URL requested through each endpoint
    pub target: String,
    pub method: Method,
    /// Interval between checks
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
}

impl MonitorConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::GET,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of probing one endpoint
#[derive(Debug)]
pub struct ProbeOutcome {
    pub endpoint: Arc<ProxyEndpoint>,
    /// Response status, or why no response arrived
    pub result: Result<StatusCode>,
}

type Predicate = dyn Fn(&ProbeOutcome) -> bool + Send + Sync;

struct MonitorInner {
    source: Source,
    config: MonitorConfig,
    target: Uri,
    predicate: RwLock<Arc<Predicate>>,
    transport: ProxyTransport,
    runner: Mutex<Option<watch::Sender<bool>>>,
    check_lock: tokio::sync::Mutex<()>,
}

/// Periodic liveness prober.
///
/// A monitor starts stopped; [`Monitor::start`] arms the loop, which waits
/// `interval`, runs [`Monitor::check`] and rearms only after the check has
/// settled, so checks never overlap.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Fails with [`SupervisorError::InvalidConfig`] when the probe target
    /// is missing or not an absolute http(s) URL
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let target = parse_probe_target(&config.target)?;

        Ok(Self {
            inner: Arc::new(MonitorInner {
                source: Source::new(),
                config,
                target,
                predicate: RwLock::new(Arc::new(|outcome: &ProbeOutcome| {
                    matches!(outcome.result, Ok(status) if status == StatusCode::OK)
                })),
                transport: ProxyTransport::new(0),
                runner: Mutex::new(None),
                check_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn source(&self) -> &Source {
        &self.inner.source
    }

    pub fn add_listener(&self, balancer: &Balancer) -> Subscription {
        self.inner.source.add_listener(balancer)
    }

    /// Replace the predicate deciding whether a probe counts as alive
    pub fn on_response<F>(&self, f: F) -> &Self
    where
        F: Fn(&ProbeOutcome) -> bool + Send + Sync + 'static,
    {
        *self.inner.predicate.write() = Arc::new(f);
        self
    }

    /// Arm the check loop; a no-op when already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> &Self {
        let mut runner = self.inner.runner.lock();
        if runner.is_some() {
            return self;
        }

        let (tx, rx) = watch::channel(false);
        *runner = Some(tx);

        info!(
            "Starting monitor with {}s interval against {}",
            self.inner.config.interval.as_secs(),
            self.inner.target
        );

        tokio::spawn(run_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.interval,
            rx,
        ));
        self
    }

    /// Prevent further checks; a check in flight runs to completion
    pub fn stop(&self) -> &Self {
        if let Some(tx) = self.inner.runner.lock().take() {
            let _ = tx.send(true);
            info!("Monitor stopped");
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.runner.lock().is_some()
    }

    /// Probe every endpoint once and evict the dead ones from all listeners.
    /// Returns the evicted endpoints.
    #[instrument(skip(self), fields(target = %self.inner.target))]
    pub async fn check(&self) -> Vec<Arc<ProxyEndpoint>> {
        let _guard = self.inner.check_lock.lock().await;

        let proxies = self.inner.source.proxies();
        let total = proxies.len();
        debug!("Probing {} proxies", total);

        let outcomes = join_all(proxies.into_iter().map(|endpoint| self.probe(endpoint))).await;

        let predicate = self.inner.predicate.read().clone();
        let dead: Vec<Arc<ProxyEndpoint>> = outcomes
            .into_iter()
            .filter(|outcome| {
                let alive = predicate(outcome);
                if !alive {
                    match &outcome.result {
                        Ok(status) => warn!("Proxy {} answered {}", outcome.endpoint, status),
                        Err(e) => warn!("Proxy {} failed: {}", outcome.endpoint, e),
                    }
                }
                !alive
            })
            .map(|outcome| outcome.endpoint)
            .collect();

        self.inner.source.remove_from_all(&dead);

        info!(
            total,
            dead = dead.len(),
            "Monitor check complete"
        );
        dead
    }

    async fn probe(&self, endpoint: Arc<ProxyEndpoint>) -> ProbeOutcome {
        let result = match self.probe_request() {
            Ok(req) => timeout(
                self.inner.config.timeout,
                self.inner.transport.send(&endpoint, req, false),
            )
            .await
            .unwrap_or(Err(SupervisorError::Timeout))
            .map(|upstream| upstream.response.status()),
            Err(e) => Err(e),
        };

        ProbeOutcome { endpoint, result }
    }

    fn probe_request(&self) -> Result<Request<ProxyBody>> {
        let target = &self.inner.target;
        let req = Request::builder()
            .method(self.inner.config.method.clone())
            .uri(target.clone())
            .header(USER_AGENT, concat!("proxy-supervisor/", env!("CARGO_PKG_VERSION")))
            .body(empty_body())?;
        Ok(req)
    }
}

impl AsRef<Source> for Monitor {
    fn as_ref(&self) -> &Source {
        &self.inner.source
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(inner: Weak<MonitorInner>, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }

        let Some(inner) = inner.upgrade() else { break };
        Monitor { inner }.check().await;

        // stop() during the check prevents rearming
        if stop.has_changed().unwrap_or(true) {
            break;
        }
    }
    debug!("Monitor loop exited");
}

fn parse_probe_target(target: &str) -> Result<Uri> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SupervisorError::InvalidConfig(
            "monitor target is required".to_string(),
        ));
    }

    let uri: Uri = target.parse().map_err(|e| {
        SupervisorError::InvalidConfig(format!("invalid monitor target {}: {}", target, e))
    })?;

    match (uri.scheme_str(), uri.host()) {
        (Some("http") | Some("https"), Some(host)) if !host.is_empty() => Ok(uri),
        _ => Err(SupervisorError::InvalidConfig(format!(
            "monitor target must be an absolute http(s) URL: {}",
            target
        ))),
    }
}
