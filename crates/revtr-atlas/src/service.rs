//! The atlas service: intersection answers plus background fill-in.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, warn};

use revtr_core::ClusterMap;
use revtr_types::{
    AtlasClient, AtlasError, AtlasHop, AtlasTraceroute, Hop, IntersectionRequest,
    IntersectionResponse, Prober, TracerouteMeasurement, VpSource,
};

use crate::running::RunningTraces;
use crate::store::TraceStore;
use crate::tokens::TokenCache;

#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Staleness applied when a request leaves it at zero.
    pub default_staleness_minutes: i64,
    pub traceroute_timeout_secs: u64,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            default_staleness_minutes: 60,
            traceroute_timeout_secs: 60,
        }
    }
}

/// Serves intersection queries from the traceroute corpus and keeps the
/// corpus warm: every miss kicks off traceroutes toward the missed
/// destination from one vantage point per site.
#[derive(Clone)]
pub struct Atlas {
    store: Arc<dyn TraceStore>,
    prober: Arc<dyn Prober>,
    vps: Arc<dyn VpSource>,
    cm: ClusterMap,
    running: Arc<RunningTraces>,
    tokens: Arc<TokenCache>,
    config: AtlasConfig,
}

impl Atlas {
    pub fn new(
        store: Arc<dyn TraceStore>,
        prober: Arc<dyn Prober>,
        vps: Arc<dyn VpSource>,
        cm: ClusterMap,
        config: AtlasConfig,
    ) -> Self {
        Atlas {
            store,
            prober,
            vps,
            cm,
            running: Arc::new(RunningTraces::new()),
            tokens: Arc::new(TokenCache::new()),
            config,
        }
    }

    async fn lookup(&self, req: &IntersectionRequest) -> Option<IntersectionResponse> {
        let staleness = if req.staleness_minutes == 0 {
            self.config.default_staleness_minutes
        } else {
            req.staleness_minutes
        };
        let ignore = if req.ignore_source { Some(req.src) } else { None };
        match self
            .store
            .find_intersecting(req.address, req.dest, staleness, req.use_aliases, ignore)
            .await
        {
            Ok(Some(path)) => Some(IntersectionResponse::Path(path)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, address = %req.address, "intersection lookup failed");
                Some(IntersectionResponse::Error(e.to_string()))
            }
        }
    }

    /// Traceroute sources for filling in paths toward `dest`: trace-capable
    /// vantage points without a fresh stored trace toward `dest`, at most
    /// one per site. When the probed `address` is itself a vantage point it
    /// wins its site's slot.
    async fn fill_sources(&self, address: Hop, dest: Hop) -> Vec<Hop> {
        let vps = match self.vps.get_vps().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "vantage point roster unavailable for fill-in");
                return Vec::new();
            }
        };
        let fresh: std::collections::HashSet<Hop> = self.sources(dest).await.into_iter().collect();
        let mut by_site: std::collections::HashMap<String, Hop> = std::collections::HashMap::new();
        for vp in vps {
            if !vp.can_trace || vp.ip == dest || fresh.contains(&vp.ip) {
                continue;
            }
            let slot = by_site.entry(vp.site).or_insert(vp.ip);
            if vp.ip == address {
                *slot = vp.ip;
            }
        }
        let mut srcs: Vec<Hop> = by_site.into_values().collect();
        srcs.sort();
        srcs
    }

    /// Issues fill-in traceroutes toward `dest` from every source not
    /// already running one, storing whatever completes. `address` is the
    /// hop whose intersection missed.
    pub async fn fill_in(&self, address: Hop, dest: Hop) {
        let sources = self.fill_sources(address, dest).await;
        let added = self.running.try_add(dest, &sources);
        if added.is_empty() {
            return;
        }
        debug!(%dest, count = added.len(), "dispatching fill-in traceroutes");
        let measurements: Vec<TracerouteMeasurement> = added
            .iter()
            .map(|&src| TracerouteMeasurement {
                src,
                dst: dest,
                timeout_secs: self.config.traceroute_timeout_secs,
                attempts: 1,
                wait_secs: 2,
                staleness_minutes: self.config.default_staleness_minutes,
                check_cache: true,
                check_db: true,
            })
            .collect();
        let stream = match self.prober.traceroute(measurements).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, %dest, "fill-in dispatch failed");
                self.running.remove(dest, &added);
                return;
            }
        };
        let mut stream = stream;
        let mut stored = 0usize;
        while let Some(item) = stream.next().await {
            let resp = match item {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "fill-in traceroute failed");
                    continue;
                }
            };
            if resp.error.is_some() {
                continue;
            }
            let tr = AtlasTraceroute {
                src: resp.src,
                dst: resp.dst,
                date: Utc::now(),
                hops: resp
                    .hops
                    .iter()
                    .map(|th| AtlasHop {
                        ip: th.addr,
                        ttl: th.probe_ttl,
                    })
                    .collect(),
            };
            match self.store.store_traceroute(tr).await {
                Ok(()) => stored += 1,
                Err(e) => debug!(error = %e, src = %resp.src, "fill-in trace not stored"),
            }
        }
        info!(%dest, stored, "fill-in round finished");
        self.running.remove(dest, &added);
    }

    /// Distinct sources that have a fresh stored traceroute toward `dest`.
    pub async fn sources(&self, dest: Hop) -> Vec<Hop> {
        match self
            .store
            .sources_toward(dest, self.config.default_staleness_minutes)
            .await
        {
            Ok(srcs) => srcs,
            Err(e) => {
                warn!(error = %e, %dest, "source listing failed");
                Vec::new()
            }
        }
    }

    /// Exposes the alias map so callers sharing an atlas can share its
    /// cache too.
    pub fn cluster_map(&self) -> &ClusterMap {
        &self.cm
    }
}

#[async_trait]
impl AtlasClient for Atlas {
    async fn get_intersecting_path(
        &self,
        requests: Vec<IntersectionRequest>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError> {
        let mut responses = Vec::with_capacity(requests.len());
        for req in requests {
            match self.lookup(&req).await {
                Some(resp) => responses.push(Ok(resp)),
                None => {
                    let address = req.address;
                    let dest = req.dest;
                    let token = self.tokens.issue(req);
                    let atlas = self.clone();
                    tokio::spawn(async move { atlas.fill_in(address, dest).await });
                    responses.push(Ok(IntersectionResponse::Token(token)));
                }
            }
        }
        Ok(stream::iter(responses).boxed())
    }

    async fn get_paths_with_token(
        &self,
        tokens: Vec<u32>,
    ) -> Result<BoxStream<'static, Result<IntersectionResponse, AtlasError>>, AtlasError> {
        let mut responses = Vec::with_capacity(tokens.len());
        for token in tokens {
            let resp = match self.tokens.redeem(token) {
                Some(req) => self
                    .lookup(&req)
                    .await
                    .unwrap_or(IntersectionResponse::NoneFound),
                None => IntersectionResponse::NoneFound,
            };
            responses.push(Ok(resp));
        }
        Ok(stream::iter(responses).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use revtr_types::{
        ClusterError, ClusterSource, PingMeasurement, PingResponse, ProbeError,
        TracerouteHop, TracerouteResponse, VantagePoint, VpError,
    };

    use crate::store::MemTraceStore;

    struct NoClusters;

    impl ClusterSource for NoClusters {
        fn cluster_id_for_ip(&self, _ip: Hop) -> Result<Option<i64>, ClusterError> {
            Ok(None)
        }

        fn ips_for_cluster(&self, _id: i64) -> Result<Vec<Hop>, ClusterError> {
            Ok(Vec::new())
        }
    }

    struct SiteVps(Vec<VantagePoint>);

    #[async_trait]
    impl VpSource for SiteVps {
        async fn get_vps(&self) -> Result<Vec<VantagePoint>, VpError> {
            Ok(self.0.clone())
        }

        async fn get_rr_spoofers(
            &self,
            _target: Hop,
            _max: usize,
        ) -> Result<Vec<VantagePoint>, VpError> {
            Ok(Vec::new())
        }

        async fn get_ts_spoofers(
            &self,
            _target: Hop,
            _max: usize,
        ) -> Result<Vec<VantagePoint>, VpError> {
            Ok(Vec::new())
        }
    }

    /// Answers every traceroute with src -> 10.0.0.1 -> dst and records
    /// what was asked.
    struct StraightProber {
        issued: Mutex<Vec<TracerouteMeasurement>>,
    }

    #[async_trait]
    impl Prober for StraightProber {
        async fn ping(
            &self,
            _measurements: Vec<PingMeasurement>,
        ) -> Result<BoxStream<'static, Result<PingResponse, ProbeError>>, ProbeError> {
            Ok(stream::iter(Vec::new()).boxed())
        }

        async fn traceroute(
            &self,
            measurements: Vec<TracerouteMeasurement>,
        ) -> Result<BoxStream<'static, Result<TracerouteResponse, ProbeError>>, ProbeError> {
            let responses: Vec<Result<TracerouteResponse, ProbeError>> = measurements
                .iter()
                .map(|m| {
                    Ok(TracerouteResponse {
                        src: m.src,
                        dst: m.dst,
                        hops: vec![
                            TracerouteHop {
                                addr: "10.0.0.1".parse().unwrap(),
                                probe_ttl: 1,
                            },
                            TracerouteHop {
                                addr: m.dst,
                                probe_ttl: 2,
                            },
                        ],
                        error: None,
                    })
                })
                .collect();
            self.issued
                .lock()
                .map_err(|_| ProbeError::Transport("poisoned".into()))?
                .extend(measurements);
            Ok(stream::iter(responses).boxed())
        }
    }

    fn h(s: &str) -> Hop {
        s.parse().unwrap()
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

    fn atlas_with(vps: Vec<VantagePoint>) -> (Atlas, Arc<StraightProber>) {
        let cm = ClusterMap::new(Arc::new(NoClusters));
        let prober = Arc::new(StraightProber {
            issued: Mutex::new(Vec::new()),
        });
        let atlas = Atlas::new(
            Arc::new(MemTraceStore::new(cm.clone())),
            prober.clone(),
            Arc::new(SiteVps(vps)),
            cm,
            AtlasConfig::default(),
        );
        (atlas, prober)
    }

    fn request(address: &str, dest: &str) -> IntersectionRequest {
        IntersectionRequest {
            address: h(address),
            dest: h(dest),
            staleness_minutes: 0,
            use_aliases: true,
            ignore_source: false,
            src: Hop::UNKNOWN,
        }
    }

    #[tokio::test]
    async fn miss_hands_out_a_token_and_fill_in_makes_it_redeemable() {
        let (atlas, prober) = atlas_with(vec![vp("7.7.7.7", "a"), vp("8.8.8.8", "b")]);

        let mut stream = atlas
            .get_intersecting_path(vec![request("10.0.0.1", "1.1.1.1")])
            .await
            .unwrap();
        let token = match stream.next().await.unwrap().unwrap() {
            IntersectionResponse::Token(t) => t,
            other => panic!("expected a token, got {other:?}"),
        };

        // Run the fill-in inline instead of racing the spawned copy; the
        // running-traces ledger makes the second dispatch a no-op.
        atlas.fill_in(h("10.0.0.1"), h("1.1.1.1")).await;
        assert!(!prober.issued.lock().unwrap().is_empty());

        let mut stream = atlas.get_paths_with_token(vec![token]).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            IntersectionResponse::Path(path) => {
                assert_eq!(path.hops.last(), Some(&h("1.1.1.1")));
            }
            other => panic!("expected a path, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hit_returns_the_stored_suffix() {
        let (atlas, _) = atlas_with(vec![vp("7.7.7.7", "a")]);
        atlas.fill_in(h("10.0.0.1"), h("1.1.1.1")).await;
        assert_eq!(atlas.sources(h("1.1.1.1")).await, vec![h("7.7.7.7")]);

        let mut stream = atlas
            .get_intersecting_path(vec![request("10.0.0.1", "1.1.1.1")])
            .await
            .unwrap();
        match stream.next().await.unwrap().unwrap() {
            IntersectionResponse::Path(path) => {
                assert_eq!(path.address, h("10.0.0.1"));
                assert_eq!(path.hops, vec![h("10.0.0.1"), h("1.1.1.1")]);
            }
            other => panic!("expected a path, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fill_sources_pick_one_vantage_point_per_site() {
        let (atlas, _) = atlas_with(vec![
            vp("7.7.7.7", "a"),
            vp("7.7.7.8", "a"),
            vp("8.8.8.8", "b"),
        ]);
        let sources = atlas.fill_sources(Hop::UNKNOWN, h("1.1.1.1")).await;
        assert_eq!(sources.len(), 2);
    }

    #[tokio::test]
    async fn fill_sources_prefer_the_probed_hop_over_its_site_mate() {
        let (atlas, _) = atlas_with(vec![
            vp("7.7.7.7", "a"),
            vp("7.7.7.8", "a"),
            vp("8.8.8.8", "b"),
        ]);
        let sources = atlas.fill_sources(h("7.7.7.8"), h("1.1.1.1")).await;
        assert_eq!(sources, vec![h("7.7.7.8"), h("8.8.8.8")]);
    }

    #[tokio::test]
    async fn fill_in_skips_sources_with_a_fresh_trace() {
        let (atlas, prober) = atlas_with(vec![vp("9.9.9.1", "a"), vp("9.9.9.2", "b")]);
        atlas
            .store
            .store_traceroute(AtlasTraceroute {
                src: h("9.9.9.1"),
                dst: h("8.8.8.8"),
                date: Utc::now(),
                hops: vec![AtlasHop {
                    ip: h("8.8.8.8"),
                    ttl: 1,
                }],
            })
            .await
            .unwrap();

        atlas.fill_in(Hop::UNKNOWN, h("8.8.8.8")).await;
        let issued: Vec<Hop> = prober.issued.lock().unwrap().iter().map(|m| m.src).collect();
        assert_eq!(issued, vec![h("9.9.9.2")]);
    }

    #[tokio::test]
    async fn redeeming_a_stale_token_finds_nothing() {
        let (atlas, _) = atlas_with(Vec::new());
        let mut stream = atlas.get_paths_with_token(vec![424_242]).await.unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            IntersectionResponse::NoneFound
        ));
    }
}
