//! The fallback technique: assume the reverse path mirrors the forward one.
//!
//! When no measurement can pin down the next reverse hop, a forward
//! traceroute from the source to the frontier gives a path whose mirror
//! image is at least plausible. The assumption is grown one hop at a time:
//! each visit either extends an existing assumed-symmetric frontier segment
//! in place or issues the traceroute and seeds a new one.

use futures::StreamExt;
use tracing::debug;

use revtr_types::{Hop, TracerouteMeasurement};

use crate::drivers::DriverError;
use crate::engine::Deps;
use crate::revtr::ReverseTraceroute;
use crate::segment::Segment;

pub async fn reverse_hops_assume_symmetric(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
) -> Result<(), DriverError> {
    if let Some(seg) = rt.curr_path().last_seg() {
        if seg.is_dst_sym() {
            let mut grown = seg.clone();
            let segs = rt.curr_path().segments();
            let mut ignore: Vec<Hop> = segs
                .iter()
                .take(segs.len().saturating_sub(1))
                .flat_map(|s| s.hops().iter().copied())
                .collect();
            ignore.extend(rt.dead_ends());
            grown.add_sym_hop(&ignore);
            if rt.add_and_replace_segment(grown) {
                return Ok(());
            }
            return Err(DriverError::NoHopFound);
        }
    }

    let target = rt.last_hop();
    let cluster = rt.cluster_map().get(target);
    let trace = match rt.cached_trace(&cluster) {
        Some(t) => t.clone(),
        None => issue_traceroute(rt, deps, target, cluster).await?,
    };
    let mut ignore = rt.hops();
    ignore.extend(rt.dead_ends());
    let seg = Segment::dst_sym(rt.src, target, trace, 1, &ignore);
    if rt.add_segments(vec![seg]) {
        Ok(())
    } else {
        Err(DriverError::NoHopFound)
    }
}

/// Forward traceroute from the source to the frontier, with TTL gaps kept
/// as unknown hops so assumed distances stay honest. The trace must end in
/// the frontier's cluster to be usable and is cached per cluster for the
/// rest of the run.
async fn issue_traceroute(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    target: Hop,
    cluster: String,
) -> Result<Vec<Hop>, DriverError> {
    if target.is_private() {
        rt.append_error("Frontier is in private address space; cannot traceroute to it.\n");
        return Err(DriverError::PrivateFrontier);
    }
    let m = TracerouteMeasurement {
        src: rt.src,
        dst: target,
        timeout_secs: deps.config.traceroute_timeout_secs,
        attempts: deps.config.traceroute_attempts,
        wait_secs: deps.config.traceroute_wait_secs,
        staleness_minutes: deps.config.staleness_or_default(rt.staleness_minutes),
        check_cache: true,
        check_db: true,
    };
    rt.probe_counts.tr += 1;
    let mut stream = match deps.prober.traceroute(vec![m]).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "traceroute dispatch failed");
            rt.append_error("Traceroute could not be issued.\n");
            return Err(DriverError::NoHopFound);
        }
    };
    let resp = loop {
        match stream.next().await {
            Some(Ok(r)) => break r,
            Some(Err(e)) => {
                debug!(error = %e, "traceroute failed");
                continue;
            }
            None => {
                rt.append_error("Traceroute returned no result.\n");
                return Err(DriverError::NoHopFound);
            }
        }
    };
    if let Some(err) = &resp.error {
        debug!(id = rt.id, error = %err, "traceroute reported an error");
        rt.append_error("Traceroute failed.\n");
        return Err(DriverError::NoHopFound);
    }
    let hops = resp.filled_hops();
    let last = match hops.iter().rev().find(|h| !h.is_unknown()) {
        Some(h) => *h,
        None => {
            rt.append_error("Traceroute returned no responding hops.\n");
            return Err(DriverError::NoHopFound);
        }
    };
    if !rt.cluster_map().same(last, target) {
        rt.append_error("Traceroute didn't reach destination.\n");
        return Err(DriverError::NoHopFound);
    }
    rt.cache_trace(cluster, hops.clone());
    Ok(hops)
}
