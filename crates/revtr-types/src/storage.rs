//! Persistence seams and the storable form of a finished measurement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hop::Hop;

/// Lifecycle of a reverse traceroute run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevtrStatus {
    Running,
    Completed,
    Canceled,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The inferred path reached the source.
    Reaches,
    /// The destination was only one assumed-symmetric hop away.
    Trivial,
    /// Every technique was exhausted on every partial path.
    Failed,
    /// The caller gave up on the run.
    Canceled,
}

/// Which technique produced a hop. Discriminants match the wire/DB numbering
/// used by downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentKind {
    DstRev = 1,
    DstSymRev = 2,
    TrToSrcRev = 3,
    RrRev = 4,
    SpoofRrRev = 5,
    TsAdjRev = 6,
    SpoofTsAdjRev = 7,
    SpoofTsAdjRevTsZero = 8,
    SpoofTsAdjRevTsZeroDoubleStamp = 9,
}

/// One hop of a finished path, tagged with the technique that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorableHop {
    pub hop: Hop,
    pub kind: SegmentKind,
}

/// A finished (or abandoned) reverse traceroute, flattened for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorableRevtr {
    pub id: u32,
    pub src: Hop,
    pub dst: Hop,
    pub status: RevtrStatus,
    pub stop_reason: Option<StopReason>,
    pub date: DateTime<Utc>,
    /// Wall-clock duration of the run, in nanoseconds.
    pub runtime_ns: i64,
    pub rr_issued: u32,
    pub spoofed_rr_issued: u32,
    pub ts_issued: u32,
    pub spoofed_ts_issued: u32,
    pub tr_issued: u32,
    /// Deduplicated path, source-adjacent hop last.
    pub path: Vec<StorableHop>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("traceroute does not terminate at its destination")]
    IncompleteTrace,
}

/// Sink for finished reverse traceroutes.
#[async_trait::async_trait]
pub trait RevtrStore: Send + Sync {
    async fn store_revtr(&self, revtr: StorableRevtr) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster oracle unavailable: {0}")]
    Unavailable(String),
}

/// Oracle mapping addresses to alias-cluster identifiers. Lookups are
/// synchronous: implementations are expected to answer from local data and
/// callers cache aggressively.
pub trait ClusterSource: Send + Sync {
    /// `Ok(None)` when the address belongs to no known cluster.
    fn cluster_id_for_ip(&self, ip: Hop) -> Result<Option<i64>, ClusterError>;

    fn ips_for_cluster(&self, id: i64) -> Result<Vec<Hop>, ClusterError>;
}
