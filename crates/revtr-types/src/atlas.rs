//! Atlas intersection types and client seam.
//!
//! The atlas maintains a corpus of forward traceroutes toward well-connected
//! sources. The engine asks it whether any fresh traceroute passes through a
//! given hop; a hit hands the engine the remainder of a measured path for
//! free. When nothing intersects, the atlas answers with a token and kicks
//! off fill-in traceroutes in the background; the engine redeems tokens on a
//! later pass.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::hop::Hop;

/// A stored forward traceroute. Always complete: the last hop reaches `dst`.
#[derive(Debug, Clone)]
pub struct AtlasTraceroute {
    pub src: Hop,
    pub dst: Hop,
    pub date: DateTime<Utc>,
    pub hops: Vec<AtlasHop>,
}

#[derive(Debug, Clone, Copy)]
pub struct AtlasHop {
    pub ip: Hop,
    pub ttl: u32,
}

/// One intersection question: does any traceroute toward `dest` pass through
/// `address`?
#[derive(Debug, Clone)]
pub struct IntersectionRequest {
    /// Hop the engine wants to intersect at.
    pub address: Hop,
    /// Where stored traceroutes must terminate.
    pub dest: Hop,
    /// Accept traceroutes no older than this many minutes; zero means the
    /// server default.
    pub staleness_minutes: i64,
    /// Treat alias-cluster members of `address` as matches.
    pub use_aliases: bool,
    /// When set, ignore traceroutes issued from `src` itself.
    pub ignore_source: bool,
    pub src: Hop,
}

/// The tail of a stored traceroute, from the matched hop through the
/// destination.
#[derive(Debug, Clone)]
pub struct AtlasPath {
    /// The stored hop that matched the request (possibly an alias of the
    /// requested address).
    pub address: Hop,
    pub hops: Vec<Hop>,
}

/// Answer to an intersection request or a token redemption.
#[derive(Debug, Clone)]
pub enum IntersectionResponse {
    Path(AtlasPath),
    /// No hit yet; redeem later once fill-in traceroutes land.
    Token(u32),
    NoneFound,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    #[error("atlas rpc failed: {0}")]
    Rpc(String),
    #[error("atlas request timed out")]
    Timeout,
}

#[async_trait::async_trait]
pub trait AtlasClient: Send + Sync {
    /// Sends a full batch of intersection requests and streams the answers.
    async fn get_intersecting_path(
        &self,
        requests: Vec<IntersectionRequest>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError>;

    /// Redeems previously issued tokens against traceroutes that have since
    /// been collected.
    async fn get_paths_with_token(
        &self,
        tokens: Vec<u32>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError>;
}
