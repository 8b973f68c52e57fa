//! Load balancer holding a staged and a live upstream set

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use crate::routing::ProxyUpstream;

/// Staged upstreams are keyed by route block id and upstream id, so one
/// endpoint can serve several blocks of the same resource.
type StagedKey = (String, String);

/// Upstream sets of the proxy. Compilation stages upstreams, `apply_staged`
/// swaps the staged set in as the live one.
#[derive(Default)]
pub struct LoadBalancer {
    staged: Mutex<BTreeMap<StagedKey, ProxyUpstream>>,
    live: RwLock<Arc<Vec<ProxyUpstream>>>,
    next: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an upstream, replacing any staged upstream with the same id
    /// for the same route block
    pub fn add_staged(&self, upstream: ProxyUpstream) {
        let key = (upstream.meta.block.id.clone(), upstream.id.clone());
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.insert(key, upstream);
    }

    /// Number of staged upstreams
    pub fn staged_len(&self) -> usize {
        self.staged.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear_staged(&self) {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Make the staged set live and start a new empty staged set.
    /// Returns the number of live upstreams.
    pub fn apply_staged(&self) -> usize {
        let staged = std::mem::take(&mut *self.staged.lock().unwrap_or_else(|e| e.into_inner()));
        let upstreams: Vec<ProxyUpstream> = staged.into_values().collect();
        let count = upstreams.len();
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(upstreams);
        info!("Applied routing table with {} upstream(s)", count);
        count
    }

    /// Live upstreams, sorted by route block and id
    pub fn live(&self) -> Arc<Vec<ProxyUpstream>> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pick a live upstream for `req`, rotating over the matching ones
    pub fn select<B>(&self, req: &http::Request<B>) -> Option<ProxyUpstream> {
        let live = self.live();
        let matching: Vec<&ProxyUpstream> = live.iter().filter(|u| u.matches(req)).collect();
        if matching.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(matching[n % matching.len()].clone())
    }
}
