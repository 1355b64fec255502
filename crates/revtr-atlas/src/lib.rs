//! Traceroute atlas: a corpus of forward traceroutes toward well-connected
//! sources, served as intersection answers.
//!
//! The reverse traceroute engine asks "does any fresh traceroute toward S
//! pass through hop H?". A hit donates the measured tail H→S to the run.
//! Misses are answered with a claim token while fill-in traceroutes are
//! dispatched in the background from one vantage point per site; the
//! engine redeems tokens later in the run.

pub mod running;
pub mod service;
pub mod store;
pub mod tokens;

pub use running::RunningTraces;
pub use service::{Atlas, AtlasConfig};
pub use store::{MemTraceStore, TraceStore};
pub use tokens::TokenCache;
