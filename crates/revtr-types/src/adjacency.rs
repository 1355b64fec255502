//! Router adjacencies harvested from historical traceroutes.
//!
//! The timestamp technique cannot discover hops on its own; it can only
//! confirm candidates. Candidates come from an adjacency corpus: pairs of
//! addresses observed consecutively in traceroutes, plus a sharper table of
//! adjacencies seen immediately before a given destination /24.

use crate::hop::Hop;

/// Two addresses seen adjacent in some traceroute, with an occurrence count.
#[derive(Debug, Clone, Copy)]
pub struct Adjacency {
    pub ip1: Hop,
    pub ip2: Hop,
    pub cnt: u32,
}

/// An adjacency observed next to a specific destination /24.
#[derive(Debug, Clone, Copy)]
pub struct AdjacencyToDest {
    pub dest24: u32,
    pub address: Hop,
    pub adjacent: Hop,
    pub cnt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AdjacencyError {
    #[error("adjacency source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait AdjacencySource: Send + Sync {
    /// Adjacencies where `ip` appears first.
    async fn get_adjacencies_by_ip1(&self, ip: Hop) -> Result<Vec<Adjacency>, AdjacencyError>;

    /// Adjacencies where `ip` appears second.
    async fn get_adjacencies_by_ip2(&self, ip: Hop) -> Result<Vec<Adjacency>, AdjacencyError>;

    /// Adjacencies of `addr` observed on paths into `dest24`.
    async fn get_adjacency_to_dest(
        &self,
        dest24: u32,
        addr: Hop,
    ) -> Result<Vec<AdjacencyToDest>, AdjacencyError>;
}
