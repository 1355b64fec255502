//! Tokens handed out for intersection misses.
//!
//! When the atlas has no answer it still owes the caller one later; the
//! token is the claim ticket. Tokens remember the original request so
//! redemption can re-run the lookup against whatever fill-in traceroutes
//! have landed since.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use revtr_types::IntersectionRequest;

/// Unredeemed tokens older than this are dropped; their fill-in results
/// stay in the store either way.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

pub struct TokenCache {
    next: AtomicU32,
    pending: Mutex<HashMap<u32, Entry>>,
}

struct Entry {
    issued: Instant,
    request: IntersectionRequest,
}

impl Default for TokenCache {
    fn default() -> Self {
        TokenCache {
            // Token zero is reserved so callers can use it as "no token".
            next: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl TokenCache {
    pub fn new() -> Self {
        TokenCache::default()
    }

    pub fn issue(&self, request: IntersectionRequest) -> u32 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let mut pending = match self.pending.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        pending.retain(|_, e| e.issued.elapsed() < TOKEN_TTL);
        pending.insert(
            token,
            Entry {
                issued: Instant::now(),
                request,
            },
        );
        token
    }

    /// Consumes a token, returning the request it was issued for. Expired
    /// and unknown tokens return nothing.
    pub fn redeem(&self, token: u32) -> Option<IntersectionRequest> {
        let mut pending = match self.pending.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let entry = pending.remove(&token)?;
        if entry.issued.elapsed() >= TOKEN_TTL {
            return None;
        }
        Some(entry.request)
    }
}
