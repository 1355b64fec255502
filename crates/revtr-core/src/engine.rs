//! The run loop: a step machine over the technique drivers.
//!
//! Each reverse traceroute runs as one task stepping through techniques in
//! preference order, from free (atlas intersection) to cheap (record
//! route) to slow (timestamp) to speculative (assume symmetric). A step
//! returns the next step, or nothing when the run is over; drivers report
//! why they added nothing and the transition table here turns that into
//! the next technique to try. Probe fan-out happens inside the drivers;
//! the machine itself is strictly sequential per run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use revtr_types::{
    AdjacencySource, AtlasClient, Hop, Prober, RevtrStore, StopReason, StorableRevtr, VpSource,
};

use crate::clustermap::ClusterMap;
use crate::config::EngineConfig;
use crate::drivers::{
    collect_background_trs, reverse_hops_assume_symmetric, reverse_hops_rr, reverse_hops_ts,
    reverse_hops_tr_to_src, DriverError,
};
use crate::revtr::ReverseTraceroute;

/// Everything a run needs from the outside world.
#[derive(Clone)]
pub struct Deps {
    pub prober: Arc<dyn Prober>,
    pub atlas: Arc<dyn AtlasClient>,
    pub vps: Arc<dyn VpSource>,
    pub adjacencies: Arc<dyn AdjacencySource>,
    pub store: Arc<dyn RevtrStore>,
    pub config: EngineConfig,
}

/// One requested reverse traceroute.
#[derive(Debug, Clone)]
pub struct RevtrRequest {
    pub src: Hop,
    pub dst: Hop,
    /// Cache staleness in minutes; zero picks the configured default.
    pub staleness_minutes: i64,
    /// Try assuming the destination's first hop is symmetric before
    /// probing. Cheap when the destination is one hop off a measured path.
    pub backoff_endhost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    BackoffEndhost,
    TrToSource,
    RecordRoute,
    Timestamp,
    BackgroundTrs,
    AssumeSymmetric,
}

#[derive(Clone)]
pub struct Engine {
    deps: Deps,
}

impl Engine {
    pub fn new(deps: Deps) -> Self {
        Engine { deps }
    }

    /// Drives one run to completion. Cancellation is honored between step
    /// transitions; probes already in flight are abandoned. The finished
    /// run is persisted regardless of how it stopped.
    pub async fn run(&self, rt: &mut ReverseTraceroute, cancel: CancellationToken) -> StopReason {
        info!(id = rt.id, src = %rt.src, dst = %rt.dst, "starting reverse traceroute");
        let mut step = if rt.backoff_endhost {
            Step::BackoffEndhost
        } else {
            Step::TrToSource
        };
        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Canceled;
            }
            let prev = step;
            let next = tokio::select! {
                _ = cancel.cancelled() => break StopReason::Canceled,
                next = self.run_step(rt, step) => next,
            };
            match next {
                Some(next) => step = next,
                None if rt.reaches() => {
                    break if prev == Step::BackoffEndhost {
                        StopReason::Trivial
                    } else {
                        StopReason::Reaches
                    };
                }
                None => break StopReason::Failed,
            }
        };
        rt.set_stopped(reason);
        info!(id = rt.id, ?reason, hops = rt.hops().len(), "reverse traceroute finished");
        if let Err(e) = self.deps.store.store_revtr(rt.to_storable()).await {
            warn!(id = rt.id, error = %e, "failed to persist reverse traceroute");
        }
        reason
    }

    /// Runs a batch in parallel, emitting each result as its run finishes.
    /// Emission order is completion order.
    pub fn run_batch(
        &self,
        requests: Vec<RevtrRequest>,
        cm: ClusterMap,
        cancel: CancellationToken,
    ) -> ReceiverStream<StorableRevtr> {
        let (tx, rx) = mpsc::channel(requests.len().max(1));
        for (i, req) in requests.into_iter().enumerate() {
            let engine = self.clone();
            let tx = tx.clone();
            let cm = cm.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut rt = ReverseTraceroute::new(
                    i as u32 + 1,
                    req.src,
                    req.dst,
                    req.staleness_minutes,
                    req.backoff_endhost,
                    cm,
                );
                engine.run(&mut rt, cancel).await;
                let _ = tx.send(rt.to_storable()).await;
            });
        }
        ReceiverStream::new(rx)
    }

    async fn run_step(&self, rt: &mut ReverseTraceroute, step: Step) -> Option<Step> {
        debug!(id = rt.id, ?step, frontier = %rt.last_hop(), "running step");
        match step {
            Step::BackoffEndhost => self.backoff_endhost(rt).await,
            Step::TrToSource => self.tr_to_source(rt).await,
            Step::RecordRoute => self.record_route(rt).await,
            Step::Timestamp => self.timestamp(rt).await,
            Step::BackgroundTrs => self.background_trs(rt).await,
            Step::AssumeSymmetric => self.assume_symmetric(rt).await,
        }
    }

    /// One symmetry assumption before any probing: when the destination is
    /// a dead end one hop off the source's forward path, this finishes the
    /// run without spending a single spoofed probe.
    async fn backoff_endhost(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        match reverse_hops_assume_symmetric(rt, &self.deps).await {
            Ok(()) if rt.reaches() => None,
            Ok(()) => Some(Step::TrToSource),
            Err(e) => {
                debug!(id = rt.id, error = %e, "endhost backoff failed");
                rt.fail_curr_path();
                if rt.failed() {
                    None
                } else {
                    Some(Step::TrToSource)
                }
            }
        }
    }

    async fn tr_to_source(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        if rt.reaches() {
            return None;
        }
        match reverse_hops_tr_to_src(rt, &self.deps).await {
            Ok(()) if rt.reaches() => None,
            Ok(()) => self.checkbg(rt, Step::TrToSource).await,
            Err(_) => Some(Step::RecordRoute),
        }
    }

    /// Record-route attempts drain the frontier's vantage points batch by
    /// batch; a graft sends us back to the atlas, exhaustion moves on to
    /// timestamps.
    async fn record_route(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        loop {
            match reverse_hops_rr(rt, &self.deps).await {
                Ok(()) if rt.reaches() => return None,
                Ok(()) => return self.checkbg(rt, Step::TrToSource).await,
                Err(DriverError::NoVpsLeft) => return Some(Step::Timestamp),
                Err(e) => {
                    debug!(id = rt.id, error = %e, "record-route attempt came up empty");
                }
            }
        }
    }

    async fn timestamp(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        loop {
            match reverse_hops_ts(rt, &self.deps).await {
                Ok(()) if rt.reaches() => return None,
                Ok(()) => return self.checkbg(rt, Step::TrToSource).await,
                Err(DriverError::NoVpsLeft) | Err(DriverError::NoAdjacentsLeft) => {
                    return Some(Step::BackgroundTrs);
                }
                Err(e) => {
                    debug!(id = rt.id, error = %e, "timestamp round came up empty");
                }
            }
        }
    }

    /// Last chance before assuming symmetry: redeem any atlas tokens we
    /// collected along the way.
    async fn background_trs(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        match collect_background_trs(rt, &self.deps).await {
            Ok(()) if rt.reaches() => None,
            _ => Some(Step::AssumeSymmetric),
        }
    }

    async fn assume_symmetric(&self, rt: &mut ReverseTraceroute) -> Option<Step> {
        match reverse_hops_assume_symmetric(rt, &self.deps).await {
            Ok(()) if rt.reaches() => None,
            Ok(()) => Some(Step::TrToSource),
            Err(e) => {
                debug!(id = rt.id, error = %e, "symmetry assumption failed");
                rt.fail_curr_path();
                if rt.failed() {
                    None
                } else {
                    Some(Step::TrToSource)
                }
            }
        }
    }

    async fn checkbg(&self, rt: &mut ReverseTraceroute, next: Step) -> Option<Step> {
        match collect_background_trs(rt, &self.deps).await {
            Ok(()) if rt.reaches() => None,
            _ => Some(next),
        }
    }
}
