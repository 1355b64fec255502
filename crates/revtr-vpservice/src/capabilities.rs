//! Periodic capability probing.
//!
//! Capabilities decay silently: sites re-image machines, upstreams start
//! filtering spoofed packets, paths stop honoring IP options. Every round
//! takes the least recently checked vantage points and has them probe each
//! other: a plain ping, a record-route ping, a pre-specified timestamp
//! ping, and a spoofed ping whose reply landing at the spoofed address
//! proves both the transmitter's spoofing and the receiver's spoofed-reply
//! delivery. Vantage points with no working probe type at all are
//! quarantined.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use revtr_types::{Hop, PingMeasurement, Prober, TsOption, VantagePoint};

use crate::service::VpService;

#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    pub interval_secs: u64,
    /// Vantage points probed per round.
    pub batch_size: usize,
    pub probe_timeout_secs: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        CapabilityConfig {
            interval_secs: 5 * 60,
            batch_size: 10,
            probe_timeout_secs: 20,
        }
    }
}

pub struct CapabilityProber {
    service: Arc<VpService>,
    prober: Arc<dyn Prober>,
    config: CapabilityConfig,
}

impl CapabilityProber {
    pub fn new(service: Arc<VpService>, prober: Arc<dyn Prober>, config: CapabilityConfig) -> Self {
        CapabilityProber {
            service,
            prober,
            config,
        }
    }

    /// Probes forever, one round per interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("capability probing stopped");
                    return;
                }
                _ = ticker.tick() => self.probe_round().await,
            }
        }
    }

    /// One round: sweep expired quarantines, then cross-probe the stalest
    /// batch and record what worked.
    pub async fn probe_round(&self) {
        self.service.release_expired();
        let batch = self.service.stalest_vps(self.config.batch_size);
        if batch.len() < 2 {
            debug!(size = batch.len(), "not enough vantage points to cross-probe");
            return;
        }
        let pings = self.cross_probes(&batch);
        let stream = match self.prober.ping(pings).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "capability probe dispatch failed");
                return;
            }
        };

        let now = Utc::now();
        let mut probed: HashMap<Hop, Probed> = batch
            .iter()
            .map(|vp| {
                let mut fresh = vp.clone();
                fresh.can_ping = false;
                fresh.record_route = false;
                fresh.timestamp = false;
                fresh.can_spoof = false;
                fresh.receive_spoof = false;
                fresh.last_check = now;
                (vp.ip, Probed { vp: fresh, any: false })
            })
            .collect();

        let mut stream = stream;
        while let Some(item) = stream.next().await {
            let resp = match item {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "capability probe failed");
                    continue;
                }
            };
            if resp.spoofed_from != resp.src && !resp.spoofed_from.is_unknown() {
                if let Some(p) = probed.get_mut(&resp.spoofed_from) {
                    p.vp.can_spoof = true;
                    p.any = true;
                }
                if let Some(p) = probed.get_mut(&resp.src) {
                    p.vp.receive_spoof = true;
                    p.any = true;
                }
                continue;
            }
            let Some(p) = probed.get_mut(&resp.src) else { continue };
            p.any = true;
            p.vp.can_ping = true;
            if let Some(reply) = resp.replies.first() {
                if reply.rr.iter().any(|h| !h.is_unknown()) {
                    p.vp.record_route = true;
                }
                if reply.tsandaddr.iter().any(|s| s.ts != 0) {
                    p.vp.timestamp = true;
                }
            }
        }

        for (ip, p) in probed {
            if p.any {
                self.service.update_capabilities(p.vp);
            } else {
                self.service.update_capabilities(p.vp);
                self.service.quarantine(ip);
            }
        }
    }

    /// Each vantage point probes its neighbor in the batch three ways, and
    /// sends one spoofed probe to the next-but-one pretending to be the
    /// neighbor.
    fn cross_probes(&self, batch: &[VantagePoint]) -> Vec<PingMeasurement> {
        let mut pings = Vec::with_capacity(batch.len() * 4);
        for (i, vp) in batch.iter().enumerate() {
            let peer = &batch[(i + 1) % batch.len()];
            let third = &batch[(i + 2) % batch.len()];

            let mut plain = self.base(vp.ip, peer.ip);
            pings.push(plain.clone());
            plain.rr = true;
            pings.push(plain);

            let mut ts = self.base(vp.ip, peer.ip);
            ts.timestamp = Some(TsOption::Prespec(vec![peer.ip]));
            pings.push(ts);

            let mut spoofed = self.base(vp.ip, third.ip);
            spoofed.spoof = true;
            spoofed.spoof_as = Some(peer.ip);
            pings.push(spoofed);
        }
        pings
    }

    fn base(&self, src: Hop, dst: Hop) -> PingMeasurement {
        let mut m = PingMeasurement::base(src, dst, 0);
        m.timeout_secs = self.config.probe_timeout_secs;
        // Capability answers must reflect the network now, not the cache.
        m.check_cache = false;
        m.check_db = false;
        m
    }
}

struct Probed {
    vp: VantagePoint,
    any: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    use revtr_types::{
        PingReply, PingResponse, ProbeError, TracerouteMeasurement, TracerouteResponse, TsAndAddr,
        VpSource,
    };

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

    /// Answers every probe affirmatively: pings echo, RR slots fill,
    /// timestamps stamp, spoofed replies arrive.
    struct Cooperative;

    #[async_trait]
    impl Prober for Cooperative {
        async fn ping(
            &self,
            measurements: Vec<PingMeasurement>,
        ) -> Result<BoxStream<'static, Result<PingResponse, ProbeError>>, ProbeError> {
            let responses: Vec<Result<PingResponse, ProbeError>> = measurements
                .iter()
                .map(|m| {
                    Ok(PingResponse {
                        src: m.spoof_as.unwrap_or(m.src),
                        dst: m.dst,
                        spoofed_from: m.src,
                        replies: vec![PingReply {
                            rr: if m.rr { vec![m.dst] } else { Vec::new() },
                            tsandaddr: match &m.timestamp {
                                Some(TsOption::Prespec(p)) => p
                                    .iter()
                                    .map(|&ip| TsAndAddr { ip, ts: 77 })
                                    .collect(),
                                _ => Vec::new(),
                            },
                        }],
                    })
                })
                .collect();
            Ok(stream::iter(responses).boxed())
        }

        async fn traceroute(
            &self,
            _measurements: Vec<TracerouteMeasurement>,
        ) -> Result<BoxStream<'static, Result<TracerouteResponse, ProbeError>>, ProbeError> {
            Ok(stream::iter(Vec::new()).boxed())
        }
    }

    struct Silent;

    #[async_trait]
    impl Prober for Silent {
        async fn ping(
            &self,
            _measurements: Vec<PingMeasurement>,
        ) -> Result<BoxStream<'static, Result<PingResponse, ProbeError>>, ProbeError> {
            Ok(stream::iter(Vec::new()).boxed())
        }

        async fn traceroute(
            &self,
            _measurements: Vec<TracerouteMeasurement>,
        ) -> Result<BoxStream<'static, Result<TracerouteResponse, ProbeError>>, ProbeError> {
            Ok(stream::iter(Vec::new()).boxed())
        }
    }

    #[tokio::test]
    async fn cooperative_batch_keeps_all_capabilities() {
        let svc = Arc::new(VpService::new());
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.add_vp(vp("1.0.0.2", "b"));
        svc.add_vp(vp("1.0.0.3", "c"));

        let prober = CapabilityProber::new(
            svc.clone(),
            Arc::new(Cooperative),
            CapabilityConfig::default(),
        );
        prober.probe_round().await;

        let vps = svc.get_vps().await.unwrap();
        assert_eq!(vps.len(), 3);
        for v in vps {
            assert!(v.can_ping && v.record_route && v.timestamp);
            assert!(v.can_spoof && v.receive_spoof);
        }
    }

    #[tokio::test]
    async fn silent_batch_is_quarantined() {
        let svc = Arc::new(VpService::new());
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.add_vp(vp("1.0.0.2", "b"));

        let prober =
            CapabilityProber::new(svc.clone(), Arc::new(Silent), CapabilityConfig::default());
        prober.probe_round().await;

        assert!(svc.is_quarantined(h("1.0.0.1")));
        assert!(svc.is_quarantined(h("1.0.0.2")));
        assert!(svc.get_vps().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_vp_round_is_a_noop() {
        let svc = Arc::new(VpService::new());
        svc.add_vp(vp("1.0.0.1", "a"));
        let prober =
            CapabilityProber::new(svc.clone(), Arc::new(Silent), CapabilityConfig::default());
        prober.probe_round().await;
        assert!(!svc.is_quarantined(h("1.0.0.1")));
    }
}
