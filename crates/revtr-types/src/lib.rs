//! Shared vocabulary for the reverse traceroute system.
//!
//! Everything here is either a plain data type that crosses a service
//! boundary (hops, probe descriptions, stored paths) or a trait seam behind
//! which a real backend sits: the measurement service, the traceroute atlas,
//! the vantage-point service, the adjacency corpus, the alias-cluster oracle,
//! and the results store. The inference engine depends only on these seams,
//! which is what makes it testable without touching the network.

pub mod adjacency;
pub mod atlas;
pub mod hop;
pub mod probe;
pub mod storage;
pub mod vps;

pub use adjacency::{Adjacency, AdjacencyError, AdjacencySource, AdjacencyToDest};
pub use atlas::{
    AtlasClient, AtlasError, AtlasHop, AtlasPath, AtlasTraceroute, IntersectionRequest,
    IntersectionResponse,
};
pub use hop::Hop;
pub use probe::{
    PingMeasurement, PingReply, PingResponse, ProbeError, Prober, TracerouteHop,
    TracerouteMeasurement, TracerouteResponse, TsAndAddr, TsOption,
};
pub use storage::{
    ClusterError, ClusterSource, RevtrStatus, RevtrStore, SegmentKind, StopReason, StorableHop,
    StorableRevtr, StoreError,
};
pub use vps::{VantagePoint, VpError, VpSource};
