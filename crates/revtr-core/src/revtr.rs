//! Per-run state of one reverse traceroute.
//!
//! The engine explores partial paths depth-first: `paths` is a stack, the
//! top entry is the branch being extended, and grafting pushes clones so a
//! failed branch can be popped without losing work. Alongside the stack the
//! run carries all per-target bookkeeping the techniques need: which
//! vantage points and adjacencies are still untried, which targets have
//! stopped answering, and counters for everything issued.
//!
//! ## Design Decisions
//!
//! - Rate-limit and VP bookkeeping is keyed by raw hop address, matching
//!   probe targeting; cluster identity only matters for path comparisons.
//! - A target's spoofed-probe responsiveness is a saturating strike count
//!   with `-1` pinned once any reply is seen, so one response permanently
//!   whitelists the target for the rest of the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use revtr_types::{
    AdjacencySource, Hop, RevtrStatus, StopReason, StorableHop, StorableRevtr, VpSource,
};

use crate::clustermap::ClusterMap;
use crate::config::EngineConfig;
use crate::path::ReversePath;
use crate::segment::Segment;

/// How a record-route probe toward a target should be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrVantage {
    /// Probe directly from the source, no spoofing.
    NonSpoofed,
    /// Spoof as the source from this vantage point.
    Spoofer(Hop),
}

/// Counters for every probe the run has issued.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeCounts {
    pub rr: u32,
    pub spoof_rr: u32,
    pub ts: u32,
    pub spoof_ts: u32,
    pub tr: u32,
}

/// Callback fired whenever the run's path state changes.
pub type OnUpdate = Arc<dyn Fn(&ReverseTraceroute) + Send + Sync>;

pub struct ReverseTraceroute {
    pub id: u32,
    pub src: Hop,
    pub dst: Hop,
    pub staleness_minutes: i64,
    /// Start by assuming the last hop is symmetric before probing it.
    pub backoff_endhost: bool,
    paths: Vec<ReversePath>,
    dead_ends: HashSet<Hop>,
    rr_rate_limit: HashMap<Hop, usize>,
    rr_vps_left: HashMap<Hop, Vec<RrVantage>>,
    ts_rate_limit: HashMap<Hop, usize>,
    ts_adjs_left: HashMap<Hop, Vec<Hop>>,
    /// Targets that answer timestamp probes but stamp every slot zero.
    pub ts_dst_to_stamps_zero: HashMap<Hop, bool>,
    /// Whether timestamp probes to a hop must be spoofed to get through.
    pub ts_send_spoofed: HashMap<Hop, bool>,
    /// Zero strikes means responsive; any strike means written off.
    ts_responsive: HashMap<Hop, i32>,
    /// Strikes per target for spoofed record-route; -1 pins responsive.
    rr_spoof_responsive: HashMap<Hop, i32>,
    /// Atlas tokens waiting to be redeemed.
    pub tokens: Vec<u32>,
    /// Forward traceroutes already issued this run, keyed by target cluster.
    traceroutes: HashMap<String, Vec<Hop>>,
    pub probe_counts: ProbeCounts,
    pub stop_reason: Option<StopReason>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    error_details: String,
    cm: ClusterMap,
    on_update: Option<OnUpdate>,
}

impl ReverseTraceroute {
    pub fn new(
        id: u32,
        src: Hop,
        dst: Hop,
        staleness_minutes: i64,
        backoff_endhost: bool,
        cm: ClusterMap,
    ) -> Self {
        ReverseTraceroute {
            id,
            src,
            dst,
            staleness_minutes,
            backoff_endhost,
            paths: vec![ReversePath::new(src, dst, vec![])],
            dead_ends: HashSet::new(),
            rr_rate_limit: HashMap::new(),
            rr_vps_left: HashMap::new(),
            ts_rate_limit: HashMap::new(),
            ts_adjs_left: HashMap::new(),
            ts_dst_to_stamps_zero: HashMap::new(),
            ts_send_spoofed: HashMap::new(),
            ts_responsive: HashMap::new(),
            rr_spoof_responsive: HashMap::new(),
            tokens: Vec::new(),
            traceroutes: HashMap::new(),
            probe_counts: ProbeCounts::default(),
            stop_reason: None,
            start_time: Utc::now(),
            end_time: None,
            error_details: String::new(),
            cm,
            on_update: None,
        }
    }

    pub fn set_on_update(&mut self, cb: OnUpdate) {
        self.on_update = Some(cb);
    }

    fn fire_update(&self) {
        if let Some(cb) = self.on_update.clone() {
            cb(self);
        }
    }

    pub fn cluster_map(&self) -> &ClusterMap {
        &self.cm
    }

    pub fn curr_path(&self) -> &ReversePath {
        // paths is never empty while a run is live; the bootstrap path only
        // disappears once the run has failed.
        self.paths.last().unwrap_or_else(|| unreachable!())
    }

    pub fn curr_path_mut(&mut self) -> Option<&mut ReversePath> {
        self.paths.last_mut()
    }

    pub fn paths_len(&self) -> usize {
        self.paths.len()
    }

    /// Hops of the branch currently being extended, destination first.
    pub fn hops(&self) -> Vec<Hop> {
        self.paths.last().map(|p| p.hops()).unwrap_or_default()
    }

    /// The frontier hop of the current branch.
    pub fn last_hop(&self) -> Hop {
        self.paths
            .last()
            .and_then(|p| p.last_hop())
            .unwrap_or(Hop::UNKNOWN)
    }

    /// Whether the current branch reaches the source. Any branch reaches iff
    /// the top of the stack does.
    pub fn reaches(&self) -> bool {
        self.paths
            .last()
            .map(|p| p.reaches(&self.cm))
            .unwrap_or(false)
    }

    /// True once every branch is exhausted. With endhost backoff the
    /// bootstrap destination-only path doesn't count as an option.
    pub fn failed(&self) -> bool {
        self.paths.is_empty()
            || (self.backoff_endhost
                && self.paths.len() == 1
                && self.paths[0].segments().len() == 1
                && matches!(self.paths[0].segments()[0], Segment::Dst(_)))
    }

    pub fn symmetric_assumptions(&self) -> usize {
        self.paths
            .last()
            .map(|p| p.symmetric_assumptions())
            .unwrap_or(0)
    }

    pub fn dead_ends(&self) -> Vec<Hop> {
        self.dead_ends.iter().copied().collect()
    }

    pub fn is_dead_end(&self, hop: Hop) -> bool {
        self.dead_ends.contains(&hop)
    }

    /// Marks the frontier dead and pops branches until one ends somewhere
    /// alive. Branches whose frontier segment is assumed-symmetric stay: the
    /// assumption can be extended instead of abandoned.
    pub fn fail_curr_path(&mut self) {
        self.dead_ends.insert(self.last_hop());
        while !self.failed()
            && self.dead_ends.contains(&self.last_hop())
            && !self
                .curr_path()
                .last_seg()
                .map(Segment::is_dst_sym)
                .unwrap_or(false)
        {
            self.paths.pop();
        }
    }

    /// Grafts candidate segments onto the current branch: one new branch per
    /// viable candidate, ranked so the best ends up on top of the stack.
    /// Candidates ending at known dead ends are dropped, as are candidates
    /// that loop-trim to nothing.
    pub fn add_segments(&mut self, mut segments: Vec<Segment>) -> bool {
        let cm = self.cm.clone();
        segments.sort_by(|a, b| a.order_against(b, &cm));
        let base_path = self.curr_path().clone();
        let mut to_del = base_path.hops();
        to_del.extend(self.dead_ends.iter().copied());
        let mut added = false;
        for mut seg in segments {
            if let Some(last) = seg.last_hop() {
                if self.dead_ends.contains(&last) {
                    continue;
                }
            }
            if let Err(e) = seg.remove_hops(&to_del, &cm) {
                debug!(error = %e, "segment still loops after trimming");
                return false;
            }
            if seg.is_empty() {
                debug!("skipping loop-causing segment");
                continue;
            }
            added = true;
            let mut cl = base_path.clone();
            cl.add(seg);
            self.paths.push(cl);
        }
        if added {
            self.fire_update();
        }
        added
    }

    /// Pushes a branch equal to the current one with its frontier segment
    /// swapped out. Used when an assumed-symmetric segment grows in place.
    pub fn add_and_replace_segment(&mut self, seg: Segment) -> bool {
        if let Some(last) = seg.last_hop() {
            if self.dead_ends.contains(&last) {
                return false;
            }
        }
        let mut base = self.curr_path().clone();
        base.pop();
        base.add(seg);
        self.paths.push(base);
        self.fire_update();
        true
    }

    /// Grafts an atlas traceroute tail. The intersection hop may sit in the
    /// middle of an older branch, so the matching branch is cloned and
    /// truncated right after the intersection before the new segment goes
    /// on.
    pub fn add_background_tr_segment(&mut self, tr_seg: Segment) -> bool {
        let intersection = match tr_seg.hops().first() {
            Some(h) => *h,
            None => return false,
        };
        let cm = self.cm.clone();
        let mut found: Option<ReversePath> = None;
        for chunk in &self.paths {
            let hops = chunk.hops();
            if let Some(index) = hops
                .iter()
                .position(|h| cm.same(*h, intersection))
            {
                found = Some(truncate_after(chunk, index));
                break;
            }
        }
        let found = match found {
            Some(p) => p,
            None => {
                debug!(%intersection, "traceroute shares no hop with any branch");
                return false;
            }
        };
        self.paths.push(found);
        let success = self.add_segments(vec![tr_seg]);
        if !success {
            // The truncated clone is useless without the graft.
            self.paths.pop();
        }
        success
    }

    // ---- record-route bookkeeping ----

    async fn initialize_rr_vps(
        &mut self,
        target: Hop,
        vps: &dyn VpSource,
        cfg: &EngineConfig,
    ) {
        self.rr_rate_limit.insert(target, cfg.rr_rate_limit);
        let mut left = vec![RrVantage::NonSpoofed];
        match vps.get_rr_spoofers(target, 0).await {
            Ok(spoofers) => {
                left.extend(spoofers.into_iter().map(|vp| RrVantage::Spoofer(vp.ip)));
            }
            Err(e) => debug!(error = %e, %target, "fetching rr spoofers failed"),
        }
        self.rr_vps_left.insert(target, left);
    }

    /// The next record-route batch: walks the frontier segment's hops from
    /// the source side back toward the destination, looking for a target
    /// with vantage points left and a pulse. The non-spoofed probe is always
    /// handed out alone and first; after that, batches of spoofers. When the
    /// frontier was itself found by a spoofed probe, that spoofer gets
    /// first crack at the next target.
    pub async fn get_rr_vps(
        &mut self,
        vps: &dyn VpSource,
        cfg: &EngineConfig,
    ) -> Option<(Vec<RrVantage>, Hop)> {
        let seg_hops: Vec<Hop> = match self.curr_path().last_seg() {
            Some(s) => s.hops().to_vec(),
            None => return None,
        };
        for hop in &seg_hops {
            if !self.rr_vps_left.contains_key(hop) {
                self.initialize_rr_vps(*hop, vps, cfg).await;
            }
        }
        let mut target = None;
        for hop in seg_hops.iter().rev() {
            let strikes = self.rr_spoof_responsive.get(hop).copied().unwrap_or(0);
            if strikes != -1 && strikes >= cfg.max_unresponsive {
                debug!(%hop, "target unresponsive to spoofed rr");
                continue;
            }
            if self.rr_vps_left.get(hop).map(Vec::len).unwrap_or(0) == 0 {
                continue;
            }
            target = Some(*hop);
            break;
        }
        let target = target?;
        let rate = self
            .rr_rate_limit
            .get(&target)
            .copied()
            .unwrap_or(cfg.rr_rate_limit);
        // Reuse the spoofer that discovered the frontier if it is still
        // available for this target.
        let recent = self
            .curr_path()
            .last_seg()
            .and_then(Segment::spoofer);
        let left = self.rr_vps_left.get_mut(&target)?;
        let batch = rate.min(left.len());
        if left[..batch].contains(&RrVantage::NonSpoofed) {
            left.retain(|v| *v != RrVantage::NonSpoofed);
            return Some((vec![RrVantage::NonSpoofed], target));
        }
        if let Some(spoofer) = recent {
            if left.contains(&RrVantage::Spoofer(spoofer)) {
                left.retain(|v| *v != RrVantage::Spoofer(spoofer));
                let take = (rate - 1).min(left.len());
                let mut out = vec![RrVantage::Spoofer(spoofer)];
                out.extend(left.drain(..take));
                return Some((out, target));
            }
        }
        let take = rate.min(left.len());
        let out: Vec<RrVantage> = left.drain(..take).collect();
        Some((out, target))
    }

    pub fn add_unresponsive_rr_target(&mut self, target: Hop, cnt: i32) {
        let entry = self.rr_spoof_responsive.entry(target).or_insert(0);
        if *entry == -1 {
            return;
        }
        *entry += cnt;
    }

    pub fn mark_responsive_rr_target(&mut self, target: Hop) {
        self.rr_spoof_responsive.insert(target, -1);
    }

    // ---- timestamp bookkeeping ----

    pub fn ts_set_unresponsive(&mut self, dst: Hop) {
        self.ts_responsive.insert(dst, 1);
    }

    pub fn ts_set_responsive(&mut self, dst: Hop) {
        self.ts_responsive.insert(dst, 0);
    }

    pub fn ts_is_responsive(&self, dst: Hop) -> bool {
        self.ts_responsive.get(&dst).copied().unwrap_or(0) == 0
    }

    async fn initialize_ts_adjacents(
        &mut self,
        hop: Hop,
        adjacencies: &dyn AdjacencySource,
        cfg: &EngineConfig,
    ) {
        match adjacencies_toward_src(hop, self.src, adjacencies, cfg.max_adjacents).await {
            Ok(adjs) => {
                let frontier = self.hops();
                let dead = &self.dead_ends;
                let filtered = adjs
                    .into_iter()
                    .filter(|a| !frontier.contains(a) && !dead.contains(a))
                    .collect();
                self.ts_adjs_left.insert(hop, filtered);
            }
            Err(e) => {
                debug!(error = %e, %hop, "adjacency lookup failed");
                self.ts_adjs_left.insert(hop, Vec::new());
            }
        }
    }

    /// The next batch of candidate adjacencies for `hop`, in priority
    /// order. Empty means exhausted.
    pub async fn get_ts_adjacents(
        &mut self,
        hop: Hop,
        adjacencies: &dyn AdjacencySource,
        cfg: &EngineConfig,
    ) -> Vec<Hop> {
        if !self.ts_adjs_left.contains_key(&hop) {
            self.initialize_ts_adjacents(hop, adjacencies, cfg).await;
        }
        let rate = self
            .ts_rate_limit
            .get(&hop)
            .copied()
            .unwrap_or(cfg.ts_rate_limit);
        let left = match self.ts_adjs_left.get_mut(&hop) {
            Some(l) => l,
            None => return Vec::new(),
        };
        let take = rate.min(left.len());
        left.drain(..take).collect()
    }

    // ---- traceroute cache ----

    pub fn cached_trace(&self, cluster: &str) -> Option<&Vec<Hop>> {
        self.traceroutes.get(cluster)
    }

    pub fn cache_trace(&mut self, cluster: String, hops: Vec<Hop>) {
        self.traceroutes.insert(cluster, hops);
    }

    // ---- run bookkeeping ----

    pub fn append_error(&mut self, detail: &str) {
        self.error_details.push_str(detail);
    }

    pub fn error_details(&self) -> &str {
        &self.error_details
    }

    pub fn take_tokens(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.tokens)
    }

    pub fn set_stopped(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.end_time = Some(Utc::now());
        self.fire_update();
    }

    /// Flattens the run for storage: the current branch's hops in order,
    /// first occurrence wins, each tagged with its technique. A failed run
    /// stores no path.
    pub fn to_storable(&self) -> StorableRevtr {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let runtime_ns = (end - self.start_time)
            .num_nanoseconds()
            .unwrap_or(i64::MAX);
        let status = match self.stop_reason {
            Some(StopReason::Canceled) => RevtrStatus::Canceled,
            Some(_) => RevtrStatus::Completed,
            None => RevtrStatus::Running,
        };
        let mut path = Vec::new();
        if !self.failed() {
            let mut seen = HashSet::new();
            for seg in self.curr_path().segments() {
                let kind = seg.kind();
                for hop in seg.hops() {
                    if seen.insert(*hop) {
                        path.push(StorableHop { hop: *hop, kind });
                    }
                }
            }
        }
        StorableRevtr {
            id: self.id,
            src: self.src,
            dst: self.dst,
            status,
            stop_reason: self.stop_reason,
            date: self.start_time,
            runtime_ns,
            rr_issued: self.probe_counts.rr,
            spoofed_rr_issued: self.probe_counts.spoof_rr,
            ts_issued: self.probe_counts.ts,
            spoofed_ts_issued: self.probe_counts.spoof_ts,
            tr_issued: self.probe_counts.tr,
            path,
        }
    }
}

/// Clones `path` cut off right after hop `index`, dropping later segments
/// entirely and trimming the segment containing the cut.
fn truncate_after(path: &ReversePath, index: usize) -> ReversePath {
    let mut kept: Vec<Segment> = Vec::new();
    let mut consumed = 0usize;
    for seg in path.segments() {
        let len = seg.length(false);
        if consumed + len <= index + 1 {
            kept.push(seg.clone());
            consumed += len;
            if consumed == index + 1 {
                break;
            }
        } else {
            let keep = index + 1 - consumed;
            let mut trimmed = seg.clone();
            let extra: Vec<Hop> = trimmed.hops()[keep..].to_vec();
            // Trimming from the tail: removing the suffix hops one at a
            // time via the loop-removal primitive would cut from the front,
            // so rebuild instead.
            let hops = trimmed.hops()[..keep].to_vec();
            trimmed = rebuild_with_hops(trimmed, hops);
            debug!(?extra, "trimmed hops past intersection");
            kept.push(trimmed);
            break;
        }
    }
    let mut out = ReversePath::new(path.src, path.dst, kept);
    debug_assert!(!out.is_empty());
    if out.last_hop().is_none() {
        out = ReversePath::new(path.src, path.dst, vec![]);
    }
    out
}

/// A copy of `seg` with its hop list replaced, keeping variant and
/// endpoints.
fn rebuild_with_hops(seg: Segment, hops: Vec<Hop>) -> Segment {
    let src = seg.src();
    let target = seg.target();
    match seg {
        Segment::Dst(_) => Segment::dst(hops.first().copied().unwrap_or(target), src),
        Segment::DstSym {
            trace, num_hops, ..
        } => {
            // Keep the counted assumptions; only the visible hops shrink.
            let mut s = Segment::dst_sym(src, target, trace, num_hops, &[]);
            if let Segment::DstSym { base, .. } = &mut s {
                *base = rebuilt_base(hops.clone(), src, target);
            }
            s
        }
        Segment::TrToSrc(_) => Segment::tr_to_src(hops, src, target),
        Segment::Rr(_) => Segment::rr(hops, src, target),
        Segment::SpoofRr { spoofer, .. } => Segment::spoof_rr(hops, src, target, spoofer),
        Segment::TsAdj(_) => Segment::ts_adj(hops, src, target),
        Segment::SpoofTsAdj { spoofer, .. } => Segment::spoof_ts_adj(hops, src, target, spoofer),
        Segment::SpoofTsAdjTsZero { spoofer, .. } => {
            Segment::spoof_ts_adj_ts_zero(hops, src, target, spoofer)
        }
        Segment::SpoofTsAdjTsZeroDoubleStamp { spoofer, .. } => {
            Segment::spoof_ts_adj_ts_zero_double_stamp(hops, src, target, spoofer)
        }
    }
}

fn rebuilt_base(hops: Vec<Hop>, src: Hop, target: Hop) -> crate::segment::SegmentBase {
    // Round-trips through a throwaway Rr segment to reuse base
    // normalization.
    match Segment::rr(hops, src, target) {
        Segment::Rr(base) => base,
        _ => unreachable!(),
    }
}

/// Candidate adjacencies of `ip` likely to sit on a reverse path toward
/// `src`: adjacencies previously seen next to `src`'s /24 first (best
/// evidence), then globally common adjacencies, capped.
async fn adjacencies_toward_src(
    ip: Hop,
    src: Hop,
    source: &dyn AdjacencySource,
    cap: usize,
) -> Result<Vec<Hop>, revtr_types::AdjacencyError> {
    let dest24 = src.prefix24();
    let ips1 = source.get_adjacencies_by_ip1(ip).await?;
    let ips2 = source.get_adjacencies_by_ip2(ip).await?;
    let mut to_dest = source.get_adjacency_to_dest(dest24, ip).await?;
    to_dest.sort_by(|a, b| b.cnt.cmp(&a.cnt));
    let dest_adjs: Vec<Hop> = to_dest.iter().map(|a| a.adjacent).collect();

    let mut combined: Vec<revtr_types::Adjacency> = ips1;
    combined.extend(ips2);
    combined.sort_by(|a, b| b.cnt.cmp(&a.cnt));
    let mut out = dest_adjs.clone();
    for adj in combined {
        let other = if adj.ip1 == ip { adj.ip2 } else { adj.ip1 };
        if other == ip || dest_adjs.contains(&other) || out.contains(&other) {
            continue;
        }
        out.push(other);
    }
    out.truncate(cap);
    Ok(out)
}
