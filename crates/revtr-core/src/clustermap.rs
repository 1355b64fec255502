//! Cached alias-cluster lookups.
//!
//! Path comparisons everywhere use cluster identity, not raw address
//! equality: two interfaces of the same router count as the same hop. The
//! oracle behind [`ClusterSource`] can be slow, so answers are cached for two
//! hours, and an address the oracle cannot place (or an oracle error) maps
//! the address to its own textual form, so equality degrades gracefully to
//! plain address equality.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use revtr_types::{ClusterSource, Hop};

const CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

struct CacheEntry {
    fetched: Instant,
    value: String,
}

/// Shared, cloneable handle over the cluster cache.
#[derive(Clone)]
pub struct ClusterMap {
    source: Arc<dyn ClusterSource>,
    cache: Arc<Mutex<HashMap<Hop, CacheEntry>>>,
}

impl ClusterMap {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        ClusterMap {
            source,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The cluster key for `ip`. Falls back to the address itself when the
    /// oracle has no answer.
    pub fn get(&self, ip: Hop) -> String {
        let now = Instant::now();
        let mut cache = match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = cache.get(&ip) {
            if now.duration_since(entry.fetched) < CACHE_TTL {
                return entry.value.clone();
            }
        }
        let value = match self.source.cluster_id_for_ip(ip) {
            Ok(Some(id)) => id.to_string(),
            Ok(None) | Err(_) => ip.to_string(),
        };
        cache.insert(
            ip,
            CacheEntry {
                fetched: now,
                value: value.clone(),
            },
        );
        value
    }

    /// Cluster-level hop equality.
    pub fn same(&self, a: Hop, b: Hop) -> bool {
        a == b || self.get(a) == self.get(b)
    }
}
