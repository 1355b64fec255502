//! Probe descriptions and the measurement-service seam.
//!
//! The inference engine never touches raw sockets. It describes the pings and
//! traceroutes it wants as [`PingMeasurement`] / [`TracerouteMeasurement`]
//! batches and hands them to a [`Prober`], which streams results back as they
//! arrive. Spoofed probes are described from the point of view of the vantage
//! point that transmits them: `src` is the transmitting VP and `spoof_as` is
//! the address written into the source field, so replies land there instead.
//!
//! ## Design Decisions
//!
//! - Batches go in as a `Vec` and come back as a stream. Callers send
//!   everything up front and then drain the stream, so slow vantage points
//!   never block probe dispatch.
//! - IP options are modeled explicitly ([`TsOption`], the `record_route`
//!   flag) rather than as stringly-typed probe arguments.

use futures::stream::BoxStream;

use crate::hop::Hop;

/// How the timestamp option should be filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsOption {
    /// Plain `ts` option: any router on the path may stamp.
    TsOnly,
    /// Pre-specified timestamp: only the listed addresses (at most four)
    /// may stamp, in order.
    Prespec(Vec<Hop>),
}

/// A single ping to issue, possibly spoofed and possibly carrying an IP
/// option.
#[derive(Debug, Clone)]
pub struct PingMeasurement {
    /// Vantage point that transmits the probe.
    pub src: Hop,
    /// Probe target.
    pub dst: Hop,
    /// Address written as the probe's source when `spoof` is set; replies
    /// are captured there.
    pub spoof_as: Option<Hop>,
    pub spoof: bool,
    /// Record-route option (9 slots).
    pub rr: bool,
    pub timestamp: Option<TsOption>,
    pub count: u32,
    pub timeout_secs: u64,
    /// Accept cached results no older than this many minutes.
    pub staleness_minutes: i64,
    pub check_cache: bool,
    pub check_db: bool,
}

impl PingMeasurement {
    /// A plain one-packet ping with caching enabled, the common base the
    /// drivers build on.
    pub fn base(src: Hop, dst: Hop, staleness_minutes: i64) -> Self {
        PingMeasurement {
            src,
            dst,
            spoof_as: None,
            spoof: false,
            rr: false,
            timestamp: None,
            count: 1,
            timeout_secs: 10,
            staleness_minutes,
            check_cache: true,
            check_db: true,
        }
    }
}

/// One stamped slot from a returned timestamp option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsAndAddr {
    pub ip: Hop,
    pub ts: u32,
}

/// One reply packet's recorded options.
#[derive(Debug, Clone, Default)]
pub struct PingReply {
    /// Recorded route, at most 9 slots, unfilled slots unknown.
    pub rr: Vec<Hop>,
    /// Timestamp slots, at most 4.
    pub tsandaddr: Vec<TsAndAddr>,
}

/// All replies captured for one issued ping.
#[derive(Debug, Clone)]
pub struct PingResponse {
    /// The probe's source address as the target saw it. For spoofed probes
    /// this is the spoofed (receiving) address, not the transmitter.
    pub src: Hop,
    pub dst: Hop,
    /// The transmitting vantage point; equal to `src` for non-spoofed
    /// probes.
    pub spoofed_from: Hop,
    pub replies: Vec<PingReply>,
}

impl PingResponse {
    pub fn responded(&self) -> bool {
        !self.replies.is_empty()
    }
}

/// A traceroute to issue.
#[derive(Debug, Clone)]
pub struct TracerouteMeasurement {
    pub src: Hop,
    pub dst: Hop,
    pub timeout_secs: u64,
    pub attempts: u32,
    /// Seconds to wait per hop.
    pub wait_secs: u32,
    pub staleness_minutes: i64,
    pub check_cache: bool,
    pub check_db: bool,
}

/// One responding hop of a traceroute, tagged with the TTL that elicited it.
#[derive(Debug, Clone, Copy)]
pub struct TracerouteHop {
    pub addr: Hop,
    pub probe_ttl: u32,
}

#[derive(Debug, Clone)]
pub struct TracerouteResponse {
    pub src: Hop,
    pub dst: Hop,
    pub hops: Vec<TracerouteHop>,
    pub error: Option<String>,
}

impl TracerouteResponse {
    /// The responding hops in TTL order with gaps materialized as unknown
    /// hops, so indices line up with hop distance.
    pub fn filled_hops(&self) -> Vec<Hop> {
        let mut out = Vec::new();
        let mut next_ttl = 1u32;
        for th in &self.hops {
            while next_ttl < th.probe_ttl {
                out.push(Hop::UNKNOWN);
                next_ttl += 1;
            }
            out.push(th.addr);
            next_ttl = th.probe_ttl + 1;
        }
        out
    }
}

/// Errors surfaced by a measurement backend.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("measurement transport failed: {0}")]
    Transport(String),
    #[error("measurement timed out")]
    Timeout,
    #[error("measurement canceled")]
    Canceled,
}

/// The measurement service seam: issues probe batches on behalf of the
/// engine, the atlas, and the vantage-point service.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn ping(
        &self,
        measurements: Vec<PingMeasurement>,
    ) -> Result<BoxStream<'static, Result<PingResponse, ProbeError>>, ProbeError>;

    async fn traceroute(
        &self,
        measurements: Vec<TracerouteMeasurement>,
    ) -> Result<BoxStream<'static, Result<TracerouteResponse, ProbeError>>, ProbeError>;
}
