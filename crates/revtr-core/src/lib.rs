//! Reverse traceroute inference.
//!
//! Forward traceroute tells you the path S→D. The reverse path D→S is in
//! general different, and routers will not report it for you; this crate
//! reconstructs it from the destination backwards using record-route and
//! pre-specified timestamp probing (with spoofing to get replies past
//! asymmetric filtering), a corpus of measured forward traceroutes toward
//! the source, and symmetry assumptions as a last resort.
//!
//! [`engine::Engine`] owns the per-run step machine, [`revtr`] holds run
//! state, [`segment`] is the path algebra everything is built on, and the
//! I/O seams (prober, atlas, vantage points, adjacencies, persistence)
//! live in `revtr-types` so callers can supply their own backends.

pub mod clustermap;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod path;
pub mod revtr;
pub mod segment;

pub use clustermap::ClusterMap;
pub use config::EngineConfig;
pub use drivers::DriverError;
pub use engine::{Deps, Engine, RevtrRequest};
pub use path::ReversePath;
pub use revtr::{ProbeCounts, ReverseTraceroute, RrVantage};
pub use segment::{LoopError, Segment};
