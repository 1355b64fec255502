//! End-to-end runs of the step machine against scripted measurement
//! backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use revtr_core::{ClusterMap, Deps, Engine, EngineConfig, ReverseTraceroute, RevtrRequest};
use revtr_types::{
    Adjacency, AdjacencyError, AdjacencySource, AdjacencyToDest, AtlasClient, AtlasError,
    AtlasPath, ClusterError, ClusterSource, Hop, IntersectionRequest, IntersectionResponse,
    PingMeasurement, PingReply, PingResponse, ProbeError, Prober, SegmentKind, StopReason,
    StorableRevtr, StoreError, RevtrStore, TracerouteHop, TracerouteMeasurement,
    TracerouteResponse, TsAndAddr, VantagePoint, VpError, VpSource,
};

fn h(s: &str) -> Hop {
    s.parse().unwrap()
}

const SRC: &str = "129.10.113.189";
const DST: &str = "8.8.8.8";

// ---- scripted seams ----

struct NoClusters;

impl ClusterSource for NoClusters {
    fn cluster_id_for_ip(&self, _ip: Hop) -> Result<Option<i64>, ClusterError> {
        Ok(None)
    }

    fn ips_for_cluster(&self, _id: i64) -> Result<Vec<Hop>, ClusterError> {
        Ok(Vec::new())
    }
}

type PingFn = Box<dyn Fn(&PingMeasurement) -> Option<PingResponse> + Send + Sync>;
type TraceFn = Box<dyn Fn(&TracerouteMeasurement) -> Option<TracerouteResponse> + Send + Sync>;

struct ScriptedProber {
    ping_fn: PingFn,
    trace_fn: TraceFn,
}

impl ScriptedProber {
    fn silent() -> Self {
        ScriptedProber {
            ping_fn: Box::new(|_| None),
            trace_fn: Box::new(|_| None),
        }
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn ping(
        &self,
        measurements: Vec<PingMeasurement>,
    ) -> Result<BoxStream<'static, Result<PingResponse, ProbeError>>, ProbeError> {
        let responses: Vec<Result<PingResponse, ProbeError>> = measurements
            .iter()
            .filter_map(|m| (self.ping_fn)(m))
            .map(Ok)
            .collect();
        Ok(stream::iter(responses).boxed())
    }

    async fn traceroute(
        &self,
        measurements: Vec<TracerouteMeasurement>,
    ) -> Result<BoxStream<'static, Result<TracerouteResponse, ProbeError>>, ProbeError> {
        let responses: Vec<Result<TracerouteResponse, ProbeError>> = measurements
            .iter()
            .filter_map(|m| (self.trace_fn)(m))
            .map(Ok)
            .collect();
        Ok(stream::iter(responses).boxed())
    }
}

#[derive(Default)]
struct ScriptedAtlas {
    paths: HashMap<Hop, AtlasPath>,
}

#[async_trait]
impl AtlasClient for ScriptedAtlas {
    async fn get_intersecting_path(
        &self,
        requests: Vec<IntersectionRequest>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError> {
        let responses: Vec<Result<IntersectionResponse, AtlasError>> = requests
            .iter()
            .map(|req| {
                Ok(match self.paths.get(&req.address) {
                    Some(p) => IntersectionResponse::Path(p.clone()),
                    None => IntersectionResponse::NoneFound,
                })
            })
            .collect();
        Ok(stream::iter(responses).boxed())
    }

    async fn get_paths_with_token(
        &self,
        tokens: Vec<u32>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError> {
        let responses: Vec<Result<IntersectionResponse, AtlasError>> = tokens
            .iter()
            .map(|_| Ok(IntersectionResponse::NoneFound))
            .collect();
        Ok(stream::iter(responses).boxed())
    }
}

#[derive(Default)]
struct ScriptedVps {
    rr: Vec<VantagePoint>,
    ts: Vec<VantagePoint>,
}

#[async_trait]
impl VpSource for ScriptedVps {
    async fn get_vps(&self) -> Result<Vec<VantagePoint>, VpError> {
        Ok(Vec::new())
    }

    async fn get_rr_spoofers(&self, _target: Hop, _max: usize) -> Result<Vec<VantagePoint>, VpError> {
        Ok(self.rr.clone())
    }

    async fn get_ts_spoofers(&self, _target: Hop, _max: usize) -> Result<Vec<VantagePoint>, VpError> {
        Ok(self.ts.clone())
    }
}

#[derive(Default)]
struct ScriptedAdjacencies {
    by_ip1: HashMap<Hop, Vec<Adjacency>>,
}

#[async_trait]
impl AdjacencySource for ScriptedAdjacencies {
    async fn get_adjacencies_by_ip1(&self, ip: Hop) -> Result<Vec<Adjacency>, AdjacencyError> {
        Ok(self.by_ip1.get(&ip).cloned().unwrap_or_default())
    }

    async fn get_adjacencies_by_ip2(&self, _ip: Hop) -> Result<Vec<Adjacency>, AdjacencyError> {
        Ok(Vec::new())
    }

    async fn get_adjacency_to_dest(
        &self,
        _dest24: u32,
        _addr: Hop,
    ) -> Result<Vec<AdjacencyToDest>, AdjacencyError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingStore {
    saved: Mutex<Vec<StorableRevtr>>,
}

#[async_trait]
impl RevtrStore for RecordingStore {
    async fn store_revtr(&self, revtr: StorableRevtr) -> Result<(), StoreError> {
        self.saved
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned".into()))?
            .push(revtr);
        Ok(())
    }
}

struct TestBed {
    engine: Engine,
    store: Arc<RecordingStore>,
    cm: ClusterMap,
}

fn bed(
    prober: ScriptedProber,
    atlas: ScriptedAtlas,
    vps: ScriptedVps,
    adjacencies: ScriptedAdjacencies,
) -> TestBed {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Arc::new(RecordingStore::default());
    let deps = Deps {
        prober: Arc::new(prober),
        atlas: Arc::new(atlas),
        vps: Arc::new(vps),
        adjacencies: Arc::new(adjacencies),
        store: store.clone(),
        config: EngineConfig::default(),
    };
    TestBed {
        engine: Engine::new(deps),
        store,
        cm: ClusterMap::new(Arc::new(NoClusters)),
    }
}

fn vp(ip: &str, site: &str) -> VantagePoint {
    VantagePoint {
        ip: h(ip),
        hostname: ip.to_string(),
        site: site.to_string(),
        can_ping: true,
        can_trace: true,
        record_route: true,
        timestamp: true,
        can_spoof: true,
        receive_spoof: true,
        last_check: Utc::now(),
    }
}

fn rr_reply(slots: &[&str]) -> Vec<PingReply> {
    let mut rr: Vec<Hop> = slots.iter().map(|s| h(s)).collect();
    rr.resize(9, Hop::UNKNOWN);
    vec![PingReply { rr, tsandaddr: Vec::new() }]
}

fn ts_reply(slots: &[(&str, u32)]) -> Vec<PingReply> {
    vec![PingReply {
        rr: Vec::new(),
        tsandaddr: slots.iter().map(|&(ip, ts)| TsAndAddr { ip: h(ip), ts }).collect(),
    }]
}

fn path_ips(stored: &StorableRevtr) -> Vec<Hop> {
    stored.path.iter().map(|sh| sh.hop).collect()
}

// ---- scenarios ----

#[tokio::test]
async fn endhost_backoff_reaches_trivially() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|_| None),
        trace_fn: Box::new(|m| {
            Some(TracerouteResponse {
                src: m.src,
                dst: m.dst,
                hops: vec![TracerouteHop { addr: m.dst, probe_ttl: 1 }],
                error: None,
            })
        }),
    };
    let bed = bed(
        prober,
        ScriptedAtlas::default(),
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, true, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Trivial);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h(SRC)]);
    assert_eq!(saved[0].rr_issued, 0);
    assert_eq!(saved[0].tr_issued, 1);
    assert_eq!(saved[0].path.last().unwrap().kind, SegmentKind::DstSymRev);
}

#[tokio::test]
async fn atlas_intersection_reaches() {
    let mut atlas = ScriptedAtlas::default();
    atlas.paths.insert(
        h(DST),
        AtlasPath {
            address: h(DST),
            hops: vec![h(DST), h("10.0.0.7"), h(SRC)],
        },
    );
    let bed = bed(
        ScriptedProber::silent(),
        atlas,
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h("10.0.0.7"), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::TrToSrcRev);
    assert_eq!(saved[0].rr_issued, 0);
}

#[tokio::test]
async fn record_route_discovers_reverse_hops() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|m| {
            if !m.rr || m.spoof {
                return None;
            }
            Some(PingResponse {
                src: m.src,
                dst: m.dst,
                spoofed_from: m.src,
                replies: rr_reply(&["10.0.0.1", DST, "10.0.0.2", SRC]),
            })
        }),
        trace_fn: Box::new(|_| None),
    };
    let bed = bed(
        prober,
        ScriptedAtlas::default(),
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h("10.0.0.2"), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::RrRev);
    assert_eq!(saved[0].rr_issued, 1);
    assert_eq!(saved[0].spoofed_rr_issued, 0);
}

#[tokio::test]
async fn spoofed_record_route_when_direct_probing_learns_nothing() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|m| {
            if !m.rr {
                return None;
            }
            if m.spoof {
                // The spoofed reply comes back to the run's source with
                // reverse slots filled.
                Some(PingResponse {
                    src: m.spoof_as.unwrap(),
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: rr_reply(&["10.0.0.1", DST, SRC]),
                })
            } else {
                // Direct probe burns every slot on the forward path.
                Some(PingResponse {
                    src: m.src,
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: rr_reply(&[
                        "10.0.0.1",
                        "10.0.0.2",
                        "10.0.0.3",
                        "10.0.0.4",
                        "10.0.0.5",
                        "10.0.0.6",
                        "10.0.0.7",
                        "10.0.0.8",
                        DST,
                    ]),
                })
            }
        }),
        trace_fn: Box::new(|_| None),
    };
    let vps = ScriptedVps {
        rr: vec![vp("5.5.5.5", "site-a")],
        ts: Vec::new(),
    };
    let bed = bed(prober, ScriptedAtlas::default(), vps, ScriptedAdjacencies::default());
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::SpoofRrRev);
    assert_eq!(saved[0].rr_issued, 1);
    assert_eq!(saved[0].spoofed_rr_issued, 1);
}

#[tokio::test]
async fn timestamp_confirms_adjacency_candidate() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|m| {
            let prespec = match &m.timestamp {
                Some(revtr_types::TsOption::Prespec(p)) => p.clone(),
                _ => return None,
            };
            // Only the real candidate probe answers; the reply shows the
            // candidate stamping both solicitations.
            if prespec.len() == 4 && prespec[1] == h(SRC) {
                Some(PingResponse {
                    src: m.src,
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(DST, 100), (SRC, 101), (SRC, 102), ("0.0.0.0", 0)]),
                })
            } else {
                None
            }
        }),
        trace_fn: Box::new(|_| None),
    };
    let mut adjacencies = ScriptedAdjacencies::default();
    adjacencies.by_ip1.insert(
        h(DST),
        vec![Adjacency { ip1: h(DST), ip2: h(SRC), cnt: 8 }],
    );
    let bed = bed(prober, ScriptedAtlas::default(), ScriptedVps::default(), adjacencies);
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::TsAdjRev);
    assert!(saved[0].ts_issued >= 1);
}

#[tokio::test]
async fn zero_stamping_target_confirms_hop_through_double_stamp() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|m| {
            let prespec = match &m.timestamp {
                Some(revtr_types::TsOption::Prespec(p)) => p.clone(),
                _ => return None,
            };
            if !m.spoof && prespec.first() == Some(&h(DST)) {
                // The target answers but stamps zeros everywhere.
                Some(PingResponse {
                    src: m.src,
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(DST, 0), (SRC, 0), (SRC, 0), ("0.0.0.0", 0)]),
                })
            } else if m.spoof && prespec.first() == Some(&h(SRC)) {
                // Spoofed candidate-only probe: stamped on the way out and
                // back but not a third time.
                Some(PingResponse {
                    src: m.spoof_as.unwrap(),
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(SRC, 0), (SRC, 7), (SRC, 0), (SRC, 0)]),
                })
            } else {
                None
            }
        }),
        trace_fn: Box::new(|_| None),
    };
    let mut adjacencies = ScriptedAdjacencies::default();
    adjacencies.by_ip1.insert(
        h(DST),
        vec![Adjacency { ip1: h(DST), ip2: h(SRC), cnt: 8 }],
    );
    let vps = ScriptedVps {
        rr: Vec::new(),
        ts: vec![vp("5.5.5.5", "site-a")],
    };
    let bed = bed(prober, ScriptedAtlas::default(), vps, adjacencies);
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::SpoofTsAdjRevTsZeroDoubleStamp);
    assert!(saved[0].spoofed_ts_issued >= 1);
}

#[tokio::test]
async fn ambiguous_single_stamp_is_verified_from_the_vantage_point() {
    let prober = ScriptedProber {
        ping_fn: Box::new(|m| {
            let prespec = match &m.timestamp {
                Some(revtr_types::TsOption::Prespec(p)) => p.clone(),
                _ => return None,
            };
            if !m.spoof && m.src == h(SRC) && prespec.first() == Some(&h(DST)) {
                Some(PingResponse {
                    src: m.src,
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(DST, 0), (SRC, 0), (SRC, 0), ("0.0.0.0", 0)]),
                })
            } else if m.spoof && prespec.first() == Some(&h(SRC)) {
                // The candidate stamps every slot: could be the forward
                // path, cannot be taken as proof yet.
                Some(PingResponse {
                    src: m.spoof_as.unwrap(),
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(SRC, 5), (SRC, 6), (SRC, 7), (SRC, 8)]),
                })
            } else if !m.spoof && m.src == h("5.5.5.5") {
                // From the vantage point itself the candidate never stamps,
                // so the earlier stamps happened on the reverse side.
                Some(PingResponse {
                    src: m.src,
                    dst: m.dst,
                    spoofed_from: m.src,
                    replies: ts_reply(&[(SRC, 0), (SRC, 0), (SRC, 0), (SRC, 0)]),
                })
            } else {
                None
            }
        }),
        trace_fn: Box::new(|_| None),
    };
    let mut adjacencies = ScriptedAdjacencies::default();
    adjacencies.by_ip1.insert(
        h(DST),
        vec![Adjacency { ip1: h(DST), ip2: h(SRC), cnt: 8 }],
    );
    let vps = ScriptedVps {
        rr: Vec::new(),
        ts: vec![vp("5.5.5.5", "site-a")],
    };
    let bed = bed(prober, ScriptedAtlas::default(), vps, adjacencies);
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Reaches);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(path_ips(&saved[0]), vec![h(DST), h(SRC)]);
    assert_eq!(saved[0].path[1].kind, SegmentKind::SpoofTsAdjRevTsZero);
    assert!(saved[0].ts_issued >= 1);
    assert!(saved[0].spoofed_ts_issued >= 1);
}

#[tokio::test]
async fn exhausted_techniques_fail_the_run() {
    let bed = bed(
        ScriptedProber::silent(),
        ScriptedAtlas::default(),
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let reason = bed.engine.run(&mut rt, CancellationToken::new()).await;
    assert_eq!(reason, StopReason::Failed);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(saved[0].stop_reason, Some(StopReason::Failed));
    assert!(saved[0].path.is_empty());
    assert!(!rt.error_details().is_empty());
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let bed = bed(
        ScriptedProber::silent(),
        ScriptedAtlas::default(),
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let mut rt = ReverseTraceroute::new(1, h(SRC), h(DST), 60, false, bed.cm.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let reason = bed.engine.run(&mut rt, cancel).await;
    assert_eq!(reason, StopReason::Canceled);

    let saved = bed.store.saved.lock().unwrap();
    assert_eq!(saved[0].status, revtr_types::RevtrStatus::Canceled);
}

#[tokio::test]
async fn batch_emits_every_run() {
    let bed = bed(
        ScriptedProber::silent(),
        ScriptedAtlas::default(),
        ScriptedVps::default(),
        ScriptedAdjacencies::default(),
    );
    let requests = vec![
        RevtrRequest {
            src: h(SRC),
            dst: h(DST),
            staleness_minutes: 0,
            backoff_endhost: false,
        },
        RevtrRequest {
            src: h(SRC),
            dst: h("9.9.9.9"),
            staleness_minutes: 0,
            backoff_endhost: false,
        },
    ];
    let results: Vec<StorableRevtr> = bed
        .engine
        .run_batch(requests, bed.cm.clone(), CancellationToken::new())
        .collect()
        .await;
    assert_eq!(results.len(), 2);
    let mut dsts: Vec<Hop> = results.iter().map(|r| r.dst).collect();
    dsts.sort();
    assert_eq!(dsts, vec![h(DST), h("9.9.9.9")]);
}
