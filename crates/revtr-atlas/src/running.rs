//! Deduplication of in-flight fill-in traceroutes.
//!
//! Many engine runs can miss in the atlas at once and each miss wants
//! traceroutes from the same handful of sources. `RunningTraces` is the
//! shared ledger: a dispatcher only issues traceroutes for the sources it
//! newly admitted, and removes them once the traceroutes land.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use revtr_types::Hop;

#[derive(Default)]
pub struct RunningTraces {
    inner: Mutex<HashMap<Hop, BTreeSet<Hop>>>,
}

impl RunningTraces {
    pub fn new() -> Self {
        RunningTraces::default()
    }

    /// Admits `srcs` as running toward `dst` and returns only the ones that
    /// were not already in flight. The stored set becomes the union.
    pub fn try_add(&self, dst: Hop, srcs: &[Hop]) -> Vec<Hop> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let running = inner.entry(dst).or_default();
        let mut added = Vec::new();
        for &src in srcs {
            if running.insert(src) {
                added.push(src);
            }
        }
        added
    }

    /// Marks `srcs` as finished toward `dst`. Unknown sources are ignored;
    /// an emptied set is dropped.
    pub fn remove(&self, dst: Hop, srcs: &[Hop]) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(running) = inner.get_mut(&dst) {
            for src in srcs {
                running.remove(src);
            }
            if running.is_empty() {
                inner.remove(&dst);
            }
        }
    }

    pub fn running_toward(&self, dst: Hop) -> Vec<Hop> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner
            .get(&dst)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
