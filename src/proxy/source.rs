//! Aggregated pool membership across subscribed balancers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::models::ProxyEndpoint;
use crate::proxy::balancer::Balancer;

#[derive(Default)]
struct SourceInner {
    listeners: Mutex<Vec<(u64, Balancer)>>,
    next_id: AtomicU64,
}

/// A publisher of pool changes.
///
/// Balancers register as listeners with [`Balancer::subscribe`]; the source
/// can then read the union of their pools and push removals to all of them.
#[derive(Clone, Default)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `balancer`. Registering the same balancer twice is allowed
    /// and yields two independent subscriptions.
    pub fn add_listener(&self, balancer: &Balancer) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, balancer.clone()));
        debug!(subscription = id, "Listener added");

        Subscription {
            id,
            source: Arc::downgrade(&self.inner),
        }
    }

    /// Snapshot of the subscribed balancers, in registration order
    pub fn listeners(&self) -> Vec<Balancer> {
        self.inner
            .listeners
            .lock()
            .iter()
            .map(|(_, balancer)| balancer.clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// One endpoint per identity across every listener's pool. When several
    /// listeners hold the same identity the last registered one wins.
    pub fn proxies(&self) -> Vec<Arc<ProxyEndpoint>> {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, Arc<ProxyEndpoint>> = HashMap::new();

        for balancer in self.listeners() {
            for endpoint in balancer.endpoints() {
                let id = endpoint.id().to_string();
                if by_id.insert(id.clone(), endpoint).is_none() {
                    order.push(id);
                }
            }
        }

        order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect()
    }

    /// Remove `endpoints` from every listener
    pub fn remove_from_all(&self, endpoints: &[Arc<ProxyEndpoint>]) {
        if endpoints.is_empty() {
            return;
        }
        for balancer in self.listeners() {
            balancer.remove_endpoints(endpoints);
        }
    }
}

impl AsRef<Source> for Source {
    fn as_ref(&self) -> &Source {
        self
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`Balancer::subscribe`]; dropping it keeps the
/// subscription, [`Subscription::unsubscribe`] ends it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    source: Weak<SourceInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(source) = self.source.upgrade() {
            source.listeners.lock().retain(|(id, _)| *id != self.id);
            debug!(subscription = self.id, "Listener removed");
        }
    }
}
