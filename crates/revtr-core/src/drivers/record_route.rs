//! Record-route probing: pings with the 9-slot RR option toward the
//! frontier.
//!
//! RR slots fill on the forward path first, then on the reverse path back
//! to wherever the reply lands. A non-spoofed probe from the source works
//! when the frontier is close; past that, vantage points spoof as the
//! source so the reply (and its reverse slots) comes back to us even when
//! the forward path from the source would eat all nine slots.

use futures::StreamExt;
use tracing::debug;

use revtr_types::{Hop, PingMeasurement};

use crate::clustermap::ClusterMap;
use crate::drivers::DriverError;
use crate::engine::Deps;
use crate::revtr::{ReverseTraceroute, RrVantage};
use crate::segment::Segment;

/// Extracts reverse hops from a recorded route toward `dst`.
///
/// Slots after the rightmost occurrence of `dst`'s cluster were stamped on
/// the way back. If `dst` never shows up, or sits in the last slot, the
/// probe ran out of room before turning around and nothing was learned.
/// With `remove_loops`, consecutive same-cluster slots collapse to one.
pub fn process_rr(dst: Hop, rr: &[Hop], cm: &ClusterMap, remove_loops: bool) -> Vec<Hop> {
    if rr.is_empty() {
        return Vec::new();
    }
    let turn = match rr.iter().rposition(|&h| cm.same(h, dst)) {
        Some(i) => i,
        None => return Vec::new(),
    };
    if turn == rr.len() - 1 {
        return Vec::new();
    }
    let mut out: Vec<Hop> = Vec::new();
    for &hop in &rr[turn + 1..] {
        if hop.is_unknown() {
            break;
        }
        if remove_loops {
            if let Some(&prev) = out.last() {
                if cm.same(prev, hop) {
                    continue;
                }
            }
        }
        out.push(hop);
    }
    out
}

/// One record-route attempt: pops the next vantage batch for the deepest
/// reachable hop of the frontier segment and probes it. Every non-empty
/// prefix of the extracted reverse hops becomes a candidate segment, so the
/// grafting order can prefer the conservative ones.
pub async fn reverse_hops_rr(rt: &mut ReverseTraceroute, deps: &Deps) -> Result<(), DriverError> {
    let (vantages, target) = match rt.get_rr_vps(deps.vps.as_ref(), &deps.config).await {
        Some((v, t)) if !v.is_empty() => (v, t),
        _ => return Err(DriverError::NoVpsLeft),
    };
    if target.is_private() {
        return Err(DriverError::PrivateFrontier);
    }
    let staleness = deps.config.staleness_or_default(rt.staleness_minutes);
    let cm = rt.cluster_map().clone();
    let mut segments: Vec<Segment> = Vec::new();

    if vantages.contains(&RrVantage::NonSpoofed) {
        let mut m = PingMeasurement::base(rt.src, target, staleness);
        m.rr = true;
        m.timeout_secs = deps.config.rr_timeout_secs;
        rt.probe_counts.rr += 1;
        let mut stream = match deps.prober.ping(vec![m]).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "rr ping dispatch failed");
                return Err(DriverError::NoHopFound);
            }
        };
        while let Some(item) = stream.next().await {
            let resp = match item {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "rr ping failed");
                    continue;
                }
            };
            let reply = match resp.replies.first() {
                Some(r) => r,
                None => continue,
            };
            let hops = process_rr(target, &reply.rr, &cm, true);
            for i in 0..hops.len() {
                segments.push(Segment::rr(hops[..=i].to_vec(), rt.src, target));
            }
        }
    } else {
        let spoofers: Vec<Hop> = vantages
            .iter()
            .filter_map(|v| match v {
                RrVantage::Spoofer(ip) => Some(*ip),
                RrVantage::NonSpoofed => None,
            })
            .collect();
        let pings: Vec<PingMeasurement> = spoofers
            .iter()
            .map(|&vp| {
                let mut m = PingMeasurement::base(vp, target, staleness);
                m.spoof = true;
                m.spoof_as = Some(rt.src);
                m.rr = true;
                m.timeout_secs = deps.config.spoof_timeout_secs;
                m
            })
            .collect();
        rt.probe_counts.spoof_rr += pings.len() as u32;
        let mut stream = match deps.prober.ping(pings).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "spoofed rr dispatch failed");
                rt.add_unresponsive_rr_target(target, spoofers.len() as i32);
                return Err(DriverError::NoHopFound);
            }
        };
        let mut responded = false;
        while let Some(item) = stream.next().await {
            let resp = match item {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "spoofed rr probe failed");
                    continue;
                }
            };
            let reply = match resp.replies.first() {
                Some(r) => r,
                None => continue,
            };
            responded = true;
            let hops = process_rr(target, &reply.rr, &cm, true);
            for i in 0..hops.len() {
                segments.push(Segment::spoof_rr(
                    hops[..=i].to_vec(),
                    rt.src,
                    target,
                    resp.spoofed_from,
                ));
            }
        }
        if responded {
            rt.mark_responsive_rr_target(target);
        } else {
            rt.add_unresponsive_rr_target(target, spoofers.len() as i32);
        }
    }

    if !segments.is_empty() && rt.add_segments(segments) {
        Ok(())
    } else {
        Err(DriverError::NoHopFound)
    }
}
