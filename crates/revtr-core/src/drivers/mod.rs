//! Measurement technique drivers.
//!
//! Each driver makes one attempt to extend the current branch of a run. A
//! driver either grafts at least one segment (`Ok`) or reports why it could
//! not, and the engine uses the error to decide which technique to try
//! next. Drivers never terminate a run themselves.

pub mod assume_symmetric;
pub mod record_route;
pub mod timestamp;
pub mod tr_to_src;

pub use assume_symmetric::reverse_hops_assume_symmetric;
pub use record_route::reverse_hops_rr;
pub use timestamp::reverse_hops_ts;
pub use tr_to_src::{collect_background_trs, reverse_hops_tr_to_src};

/// Why a driver attempt added nothing.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Probes went out (or a corpus was consulted) but nothing graftable
    /// came back.
    #[error("no reverse hop found")]
    NoHopFound,
    /// Every vantage point for every reachable target is used up.
    #[error("no vantage points left")]
    NoVpsLeft,
    /// The adjacency corpus has nothing left to test for the frontier.
    #[error("no adjacents left")]
    NoAdjacentsLeft,
    /// The frontier is in private address space; nothing can be probed.
    #[error("frontier is a private address")]
    PrivateFrontier,
}
