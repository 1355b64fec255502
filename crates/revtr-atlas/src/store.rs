//! Storage of atlas traceroutes and the intersection lookup.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use revtr_core::ClusterMap;
use revtr_types::{AtlasPath, AtlasTraceroute, Hop, StoreError};

/// Backend holding the traceroute corpus. The in-memory implementation
/// below is the reference; a database-backed one satisfies the same
/// contract.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// The most recent traceroute toward `dest` (within `staleness_minutes`)
    /// passing through `address`. With `use_aliases`, hops in `address`'s
    /// alias cluster count as matches. `ignore_src` excludes traceroutes
    /// issued from that address. The answer is the suffix of the stored
    /// trace from the matched hop through the destination.
    async fn find_intersecting(
        &self,
        address: Hop,
        dest: Hop,
        staleness_minutes: i64,
        use_aliases: bool,
        ignore_src: Option<Hop>,
    ) -> Result<Option<AtlasPath>, StoreError>;

    /// Persists one traceroute. Incomplete traces (not terminating at their
    /// destination) are rejected, never stored partially.
    async fn store_traceroute(&self, tr: AtlasTraceroute) -> Result<(), StoreError>;

    /// Distinct sources with a stored traceroute toward `dest` no older than
    /// `staleness_minutes`.
    async fn sources_toward(
        &self,
        dest: Hop,
        staleness_minutes: i64,
    ) -> Result<Vec<Hop>, StoreError>;
}

pub struct MemTraceStore {
    cm: ClusterMap,
    traces: Mutex<Vec<AtlasTraceroute>>,
}

impl MemTraceStore {
    pub fn new(cm: ClusterMap) -> Self {
        MemTraceStore {
            cm,
            traces: Mutex::new(Vec::new()),
        }
    }

    fn hop_matches(&self, stored: Hop, address: Hop, use_aliases: bool) -> bool {
        if use_aliases {
            self.cm.same(stored, address)
        } else {
            stored == address
        }
    }
}

#[async_trait]
impl TraceStore for MemTraceStore {
    async fn find_intersecting(
        &self,
        address: Hop,
        dest: Hop,
        staleness_minutes: i64,
        use_aliases: bool,
        ignore_src: Option<Hop>,
    ) -> Result<Option<AtlasPath>, StoreError> {
        let oldest = Utc::now() - Duration::minutes(staleness_minutes.max(0));
        let traces = match self.traces.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let mut best: Option<(chrono::DateTime<Utc>, AtlasPath)> = None;
        for tr in traces.iter() {
            if tr.date < oldest || !self.cm.same(tr.dst, dest) {
                continue;
            }
            if ignore_src.map(|s| s == tr.src).unwrap_or(false) {
                continue;
            }
            let hit = tr
                .hops
                .iter()
                .position(|ah| self.hop_matches(ah.ip, address, use_aliases));
            if let Some(idx) = hit {
                if best.as_ref().map(|(d, _)| tr.date > *d).unwrap_or(true) {
                    let path = AtlasPath {
                        address: tr.hops[idx].ip,
                        hops: tr.hops[idx..].iter().map(|ah| ah.ip).collect(),
                    };
                    best = Some((tr.date, path));
                }
            }
        }
        Ok(best.map(|(_, p)| p))
    }

    async fn store_traceroute(&self, tr: AtlasTraceroute) -> Result<(), StoreError> {
        let complete = tr
            .hops
            .last()
            .map(|ah| self.cm.same(ah.ip, tr.dst))
            .unwrap_or(false);
        if !complete {
            return Err(StoreError::IncompleteTrace);
        }
        let mut traces = match self.traces.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        traces.push(tr);
        Ok(())
    }

    async fn sources_toward(
        &self,
        dest: Hop,
        staleness_minutes: i64,
    ) -> Result<Vec<Hop>, StoreError> {
        let oldest = Utc::now() - Duration::minutes(staleness_minutes.max(0));
        let traces = match self.traces.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let mut srcs: Vec<Hop> = traces
            .iter()
            .filter(|tr| tr.date >= oldest && self.cm.same(tr.dst, dest))
            .map(|tr| tr.src)
            .collect();
        srcs.sort();
        srcs.dedup();
        Ok(srcs)
    }
}
