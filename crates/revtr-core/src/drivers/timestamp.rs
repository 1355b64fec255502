//! Pre-specified timestamp probing.
//!
//! RR runs out at nine slots; the IP timestamp option instead solicits
//! stamps from up to four specific addresses. To test whether a candidate
//! adjacency R of the frontier H sits on the reverse path, we send a probe
//! to H with pre-spec `[H, R, R, dummy]`. H stamps the first slot on
//! arrival; if R then stamps the remaining solicitations the packet passed
//! R after H, which puts R on the way back.
//!
//! Targets differ in how they mistreat the option, so the driver learns per
//! target: whether non-spoofed probes get through at all, whether the
//! target stamps zeros (the double-stamp flow below), and whether a stamp
//! pattern is just the well-known kernel bug that stamps later slots
//! spuriously.

use futures::StreamExt;
use tracing::debug;

use revtr_types::{Hop, PingMeasurement, PingResponse, TsAndAddr, TsOption};

use crate::drivers::DriverError;
use crate::engine::Deps;
use crate::revtr::ReverseTraceroute;
use crate::segment::Segment;

/// Who transmits a timestamp probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TsVantage {
    /// Directly from the run's source.
    NonSpoofed,
    /// From this vantage point, spoofed as the source.
    Spoofer(Hop),
}

struct TsProbe {
    dst: Hop,
    prespec: Vec<Hop>,
}

/// One timestamp round for the current frontier: drains the next batch of
/// adjacency candidates and probes them in whichever mode the target has
/// taught us to use. Ok means at least one confirmed reverse hop was
/// grafted.
pub async fn reverse_hops_ts(rt: &mut ReverseTraceroute, deps: &Deps) -> Result<(), DriverError> {
    let target = rt.last_hop();
    if target.is_unknown() || target.is_private() || !rt.ts_is_responsive(target) {
        return Err(DriverError::NoVpsLeft);
    }
    let adjs = rt
        .get_ts_adjacents(target, deps.adjacencies.as_ref(), &deps.config)
        .await;
    if adjs.is_empty() {
        return Err(DriverError::NoAdjacentsLeft);
    }
    let dummy = deps.config.dummy_ip;
    let mut segments: Vec<Segment> = Vec::new();

    if rt.ts_dst_to_stamps_zero.get(&target).copied().unwrap_or(false) {
        segments.extend(dest_does_not_stamp(rt, deps, target, &adjs).await?);
    } else if !rt.ts_send_spoofed.get(&target).copied().unwrap_or(false) {
        let probes: Vec<(TsVantage, TsProbe)> = adjs
            .iter()
            .map(|&adj| {
                (
                    TsVantage::NonSpoofed,
                    TsProbe {
                        dst: target,
                        prespec: vec![target, adj, adj, dummy],
                    },
                )
            })
            .collect();
        let responses = issue_timestamps(rt, deps, probes).await;
        let mut linux_bug = Vec::new();
        let mut stamps_zero = Vec::new();
        for (via, resp) in &responses {
            classify(rt, *via, resp, &mut segments, &mut linux_bug, &mut stamps_zero);
        }
        retest_linux_bug(rt, deps, target, &linux_bug, &mut segments).await;
        if !stamps_zero.is_empty() {
            if let Ok(more) = dest_does_not_stamp(rt, deps, target, &stamps_zero).await {
                segments.extend(more);
            }
        }
        if responses.is_empty() {
            // Nothing came back directly; maybe replies only survive when
            // they avoid the forward path. Switch this target to spoofed
            // probing and retry the same candidates now.
            rt.ts_send_spoofed.insert(target, true);
            rt.ts_set_unresponsive(target);
            segments.extend(spoofed_round(rt, deps, target, &adjs).await?);
        }
    } else {
        segments.extend(spoofed_round(rt, deps, target, &adjs).await?);
    }

    if !segments.is_empty() && rt.add_segments(segments) {
        Ok(())
    } else {
        Err(DriverError::NoHopFound)
    }
}

/// Spoofed probes for each candidate from every available TS spoofer.
async fn spoofed_round(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    target: Hop,
    adjs: &[Hop],
) -> Result<Vec<Segment>, DriverError> {
    let spoofers = match deps.vps.get_ts_spoofers(target, 0).await {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, %target, "fetching ts spoofers failed");
            return Err(DriverError::NoVpsLeft);
        }
    };
    if spoofers.is_empty() {
        return Err(DriverError::NoVpsLeft);
    }
    let dummy = deps.config.dummy_ip;
    let mut probes = Vec::new();
    for vp in &spoofers {
        for &adj in adjs {
            probes.push((
                TsVantage::Spoofer(vp.ip),
                TsProbe {
                    dst: target,
                    prespec: vec![target, adj, adj, dummy],
                },
            ));
        }
    }
    let responses = issue_timestamps(rt, deps, probes).await;
    let mut segments = Vec::new();
    let mut linux_bug = Vec::new();
    let mut stamps_zero = Vec::new();
    if !responses.is_empty() {
        rt.ts_set_responsive(target);
    }
    for (via, resp) in &responses {
        classify(rt, *via, resp, &mut segments, &mut linux_bug, &mut stamps_zero);
    }
    retest_linux_bug(rt, deps, target, &linux_bug, &mut segments).await;
    if !stamps_zero.is_empty() {
        if let Ok(more) = dest_does_not_stamp(rt, deps, target, &stamps_zero).await {
            segments.extend(more);
        }
    }
    Ok(segments)
}

/// Sorts one reply into confirmed reverse hop, suspected-buggy stamp, or
/// evidence that the target stamps zeros.
fn classify(
    rt: &mut ReverseTraceroute,
    via: TsVantage,
    resp: &PingResponse,
    segments: &mut Vec<Segment>,
    linux_bug: &mut Vec<(TsVantage, Hop)>,
    stamps_zero: &mut Vec<Hop>,
) {
    let target = resp.dst;
    let slots = match resp.replies.first() {
        Some(r) => &r.tsandaddr,
        None => return,
    };
    if slots.len() < 3 {
        return;
    }
    if via == TsVantage::NonSpoofed {
        // Direct probing works for this target; remember that.
        rt.ts_send_spoofed.insert(target, false);
    }
    if slots[2].ts != 0 {
        // The candidate stamped its second solicitation: it saw the packet
        // after the target did.
        segments.push(match via {
            TsVantage::NonSpoofed => Segment::ts_adj(vec![slots[2].ip], rt.src, target),
            TsVantage::Spoofer(vp) => Segment::spoof_ts_adj(vec![slots[2].ip], rt.src, target, vp),
        });
    } else if slots[1].ts != 0
        && (slots[1].ts < slots[0].ts || slots[1].ts - slots[0].ts > 3)
    {
        // A single stamp with an implausible clock delta. Could be a real
        // reverse hop, could be the kernel bug; re-test decides.
        linux_bug.push((via, slots[1].ip));
    } else if slots[0].ts == 0 {
        rt.ts_dst_to_stamps_zero.insert(target, true);
        stamps_zero.push(slots[1].ip);
    }
}

/// Probes `[H, dummy, dummy]` through each suspect vantage: a stamp on the
/// dummy proves the target's stack stamps slots it should not, and the
/// original suspect stamp is discarded. Re-testing can be switched off, in
/// which case suspects are simply dropped.
async fn retest_linux_bug(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    target: Hop,
    candidates: &[(TsVantage, Hop)],
    segments: &mut Vec<Segment>,
) {
    if candidates.is_empty() || !deps.config.linux_bug_retest {
        return;
    }
    let dummy = deps.config.dummy_ip;
    let vias: Vec<TsVantage> = {
        let mut seen = std::collections::HashSet::new();
        candidates
            .iter()
            .map(|(via, _)| *via)
            .filter(|via| seen.insert(*via))
            .collect()
    };
    let probes: Vec<(TsVantage, TsProbe)> = vias
        .iter()
        .map(|&via| {
            (
                via,
                TsProbe {
                    dst: target,
                    prespec: vec![target, dummy, dummy],
                },
            )
        })
        .collect();
    let responses = issue_timestamps(rt, deps, probes).await;
    let mut buggy = std::collections::HashSet::new();
    for (via, resp) in &responses {
        let slots = match resp.replies.first() {
            Some(r) => &r.tsandaddr,
            None => continue,
        };
        if slots.len() >= 2 && slots[1].ts != 0 {
            debug!(%target, "target stamps unsolicited slots; dropping suspect hops");
            buggy.insert(*via);
        }
    }
    for (via, hop) in candidates {
        if buggy.contains(via) {
            continue;
        }
        segments.push(match via {
            TsVantage::NonSpoofed => Segment::ts_adj(vec![*hop], rt.src, target),
            TsVantage::Spoofer(vp) => Segment::spoof_ts_adj(vec![*hop], rt.src, target, *vp),
        });
    }
}

/// What a spoofed `[adj x4]` reply proves about the candidate.
#[derive(Debug, PartialEq, Eq)]
enum ZeroStampEvidence {
    /// Second slot stamped while the fourth stayed zero: the candidate saw
    /// the packet both coming and going.
    DoubleStamp(Hop),
    /// A stamp that could as well have happened on the forward side; only
    /// the probe from the vantage point itself can rule that out.
    Verify(Hop),
    Nothing,
}

fn classify_zero_stamp(slots: &[TsAndAddr]) -> ZeroStampEvidence {
    if slots.len() < 4 {
        return ZeroStampEvidence::Nothing;
    }
    if slots[1].ts != 0 && slots[3].ts == 0 {
        ZeroStampEvidence::DoubleStamp(slots[1].ip)
    } else if slots[0].ts != 0 {
        ZeroStampEvidence::Verify(slots[0].ip)
    } else {
        ZeroStampEvidence::Nothing
    }
}

/// The flow for targets that answer but stamp zeros. We pre-spec only the
/// candidate, four times, via spoofers: if it stamps twice (second slot set,
/// fourth still zero) the packet crossed it both coming and going, which
/// pins it to the reverse path. A single stamp is ambiguous and gets
/// verified by probing from the vantage point directly; if from there the
/// candidate does not stamp, its stamp on the spoofed probe must have
/// happened on the reverse side.
async fn dest_does_not_stamp(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    target: Hop,
    adjs: &[Hop],
) -> Result<Vec<Segment>, DriverError> {
    let spoofers = match deps.vps.get_ts_spoofers(target, 0).await {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, %target, "fetching ts spoofers failed");
            return Err(DriverError::NoVpsLeft);
        }
    };
    if spoofers.is_empty() {
        return Err(DriverError::NoVpsLeft);
    }
    let mut probes = Vec::new();
    for vp in &spoofers {
        for &adj in adjs {
            probes.push((
                TsVantage::Spoofer(vp.ip),
                TsProbe {
                    dst: target,
                    prespec: vec![adj; 4],
                },
            ));
        }
    }
    let responses = issue_timestamps(rt, deps, probes).await;
    let mut segments = Vec::new();
    let mut verify: Vec<(Hop, Hop)> = Vec::new();
    for (via, resp) in &responses {
        let vp = match via {
            TsVantage::Spoofer(vp) => *vp,
            TsVantage::NonSpoofed => continue,
        };
        let slots = match resp.replies.first() {
            Some(r) => &r.tsandaddr,
            None => continue,
        };
        match classify_zero_stamp(slots) {
            ZeroStampEvidence::DoubleStamp(hop) => {
                segments.push(Segment::spoof_ts_adj_ts_zero_double_stamp(
                    vec![hop],
                    rt.src,
                    target,
                    vp,
                ));
            }
            ZeroStampEvidence::Verify(adj) => verify.push((vp, adj)),
            ZeroStampEvidence::Nothing => {}
        }
    }
    if verify.is_empty() {
        return Ok(segments);
    }
    let staleness = deps.config.staleness_or_default(rt.staleness_minutes);
    let pings: Vec<PingMeasurement> = verify
        .iter()
        .map(|&(vp, adj)| {
            let mut m = PingMeasurement::base(vp, target, staleness);
            m.timestamp = Some(TsOption::Prespec(vec![adj; 4]));
            m.timeout_secs = deps.config.ts_timeout_secs;
            m
        })
        .collect();
    rt.probe_counts.ts += pings.len() as u32;
    let mut stream = match deps.prober.ping(pings).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "verification dispatch failed");
            return Ok(segments);
        }
    };
    while let Some(item) = stream.next().await {
        let resp = match item {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "verification probe failed");
                continue;
            }
        };
        let vp = resp.src;
        let slots = match resp.replies.first() {
            Some(r) => &r.tsandaddr,
            None => continue,
        };
        if slots.is_empty() || slots[0].ts != 0 {
            // Stamps on the vantage point's own forward path too; nothing
            // is learned about the reverse direction.
            continue;
        }
        let adj = slots[0].ip;
        if verify.contains(&(vp, adj)) {
            segments.push(Segment::spoof_ts_adj_ts_zero(vec![adj], rt.src, target, vp));
        }
    }
    Ok(segments)
}

/// Dispatches one batch of timestamp probes and pairs each answer back with
/// the vantage that produced it. Private targets are skipped outright.
async fn issue_timestamps(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    probes: Vec<(TsVantage, TsProbe)>,
) -> Vec<(TsVantage, PingResponse)> {
    let staleness = deps.config.staleness_or_default(rt.staleness_minutes);
    let mut pings = Vec::new();
    for (via, probe) in &probes {
        if probe.dst.is_private() {
            continue;
        }
        let mut m = match via {
            TsVantage::NonSpoofed => {
                let mut m = PingMeasurement::base(rt.src, probe.dst, staleness);
                m.timeout_secs = deps.config.ts_timeout_secs;
                rt.probe_counts.ts += 1;
                m
            }
            TsVantage::Spoofer(vp) => {
                let mut m = PingMeasurement::base(*vp, probe.dst, staleness);
                m.spoof = true;
                m.spoof_as = Some(rt.src);
                m.timeout_secs = deps.config.spoof_ts_timeout_secs;
                rt.probe_counts.spoof_ts += 1;
                m
            }
        };
        m.timestamp = Some(TsOption::Prespec(probe.prespec.clone()));
        pings.push(m);
    }
    if pings.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut stream = match deps.prober.ping(pings).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "timestamp dispatch failed");
            return out;
        }
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(resp) => {
                let via = if resp.spoofed_from == resp.src || resp.spoofed_from.is_unknown() {
                    TsVantage::NonSpoofed
                } else {
                    TsVantage::Spoofer(resp.spoofed_from)
                };
                out.push((via, resp));
            }
            Err(e) => debug!(error = %e, "timestamp probe failed"),
        }
    }
    out
}
