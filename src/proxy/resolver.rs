//! Per-destination backoff bookkeeping

use std::collections::HashMap;

use crate::models::BackoffState;

/// Two-level map: target hostname -> endpoint identity -> [`BackoffState`].
///
/// Missing entries stand for the zero state and are materialized on first
/// write. Entries are never evicted, so the map grows with the number of
/// distinct destinations seen.
#[derive(Debug, Default)]
pub struct TargetResolver {
    targets: HashMap<String, HashMap<String, BackoffState>>,
}

impl TargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// States of every endpoint seen for `target`, creating the entry if needed
    pub fn get(&mut self, target: &str) -> &mut HashMap<String, BackoffState> {
        self.targets.entry(target.to_string()).or_default()
    }

    /// Current state for (`target`, `proxy_id`), zero if never recorded
    pub fn state(&self, target: &str, proxy_id: &str) -> BackoffState {
        self.targets
            .get(target)
            .and_then(|states| states.get(proxy_id))
            .copied()
            .unwrap_or_default()
    }

    /// Apply `f` to the state for (`target`, `proxy_id`) and return the result
    pub fn update<F>(&mut self, target: &str, proxy_id: &str, f: F) -> BackoffState
    where
        F: FnOnce(&mut BackoffState),
    {
        let state = self.get(target).entry(proxy_id.to_string()).or_default();
        f(state);
        *state
    }

    /// Number of distinct targets tracked
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}
