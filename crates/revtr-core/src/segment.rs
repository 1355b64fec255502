//! Reverse path segments.
//!
//! A segment is a run of hops, ordered away from the destination toward the
//! source, together with the technique that produced it. Segments are the
//! unit the engine searches over: candidate segments are ranked, grafted
//! onto partial paths, and trimmed against hops already on the path so the
//! inferred path never loops.
//!
//! ## Design Decisions
//!
//! - One enum rather than a trait object per technique. Every operation is
//!   shared except construction and a handful of variant-specific accessors,
//!   and the engine needs to clone, compare, and store segments by value.
//! - All hop comparisons go through the [`ClusterMap`]: two interfaces of
//!   one router are the same hop.

use std::cmp::Ordering;

use revtr_types::{Hop, SegmentKind};

use crate::clustermap::ClusterMap;

/// Removal was asked to cut a hop out of the middle of a segment, which
/// would leave a disconnected path.
#[derive(Debug, thiserror::Error)]
#[error("removing {hops:?} from segment {segment:?} leaves a loop")]
pub struct LoopError {
    pub hops: Vec<Hop>,
    pub segment: Vec<Hop>,
}

/// Hops plus endpoints shared by every segment variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBase {
    hops: Vec<Hop>,
    /// Source of the reverse traceroute this segment belongs to.
    pub src: Hop,
    /// The hop the producing probe targeted.
    pub target: Hop,
}

impl SegmentBase {
    /// Non-routable hops are recorded as unknown; they still occupy a
    /// position but nothing can be probed there.
    fn new(hops: Vec<Hop>, src: Hop, target: Hop) -> Self {
        SegmentBase {
            hops: hops.into_iter().map(Hop::normalized).collect(),
            src,
            target,
        }
    }
}

/// A run of reverse hops tagged with the technique that measured it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// The trivial bootstrap segment holding just the destination.
    Dst(SegmentBase),
    /// Hops assumed from a forward traceroute toward the current frontier.
    DstSym {
        base: SegmentBase,
        /// Forward trace the assumption is drawn from, as measured.
        trace: Vec<Hop>,
        /// How many non-unknown hops are currently assumed reversed.
        num_hops: usize,
    },
    /// Tail of an atlas traceroute that intersects the frontier.
    TrToSrc(SegmentBase),
    /// Record-route hops from a probe issued by the source itself.
    Rr(SegmentBase),
    /// Record-route hops from a spoofed probe.
    SpoofRr { base: SegmentBase, spoofer: Hop },
    /// Adjacency confirmed by a non-spoofed timestamp probe.
    TsAdj(SegmentBase),
    /// Adjacency confirmed by a spoofed timestamp probe.
    SpoofTsAdj { base: SegmentBase, spoofer: Hop },
    /// Adjacency inferred when the target never stamps.
    SpoofTsAdjTsZero { base: SegmentBase, spoofer: Hop },
    /// Adjacency confirmed through the double-stamp flow against a
    /// non-stamping target.
    SpoofTsAdjTsZeroDoubleStamp { base: SegmentBase, spoofer: Hop },
}

impl Segment {
    pub fn dst(hop: Hop, src: Hop) -> Segment {
        Segment::Dst(SegmentBase::new(vec![hop], src, hop))
    }

    pub fn tr_to_src(hops: Vec<Hop>, src: Hop, target: Hop) -> Segment {
        Segment::TrToSrc(SegmentBase::new(hops, src, target))
    }

    pub fn rr(hops: Vec<Hop>, src: Hop, target: Hop) -> Segment {
        Segment::Rr(SegmentBase::new(hops, src, target))
    }

    pub fn spoof_rr(hops: Vec<Hop>, src: Hop, target: Hop, spoofer: Hop) -> Segment {
        Segment::SpoofRr {
            base: SegmentBase::new(hops, src, target),
            spoofer,
        }
    }

    pub fn ts_adj(hops: Vec<Hop>, src: Hop, target: Hop) -> Segment {
        Segment::TsAdj(SegmentBase::new(hops, src, target))
    }

    pub fn spoof_ts_adj(hops: Vec<Hop>, src: Hop, target: Hop, spoofer: Hop) -> Segment {
        Segment::SpoofTsAdj {
            base: SegmentBase::new(hops, src, target),
            spoofer,
        }
    }

    pub fn spoof_ts_adj_ts_zero(hops: Vec<Hop>, src: Hop, target: Hop, spoofer: Hop) -> Segment {
        Segment::SpoofTsAdjTsZero {
            base: SegmentBase::new(hops, src, target),
            spoofer,
        }
    }

    pub fn spoof_ts_adj_ts_zero_double_stamp(
        hops: Vec<Hop>,
        src: Hop,
        target: Hop,
        spoofer: Hop,
    ) -> Segment {
        Segment::SpoofTsAdjTsZeroDoubleStamp {
            base: SegmentBase::new(hops, src, target),
            spoofer,
        }
    }

    /// Builds an assumed-symmetric segment from a forward trace toward
    /// `target`. The trace (which excludes `src`... it starts at the first
    /// hop out) is rewritten as the walk back: `[src] ++ trace[..len-1]`,
    /// reversed, then the prefix containing `num_hops` usable hops is kept.
    pub fn dst_sym(
        src: Hop,
        target: Hop,
        trace: Vec<Hop>,
        num_hops: usize,
        ignore: &[Hop],
    ) -> Segment {
        let hops = select_nonzero_hops(&reversed_walk(src, &trace), num_hops, ignore);
        Segment::DstSym {
            base: SegmentBase::new(hops, src, target),
            trace,
            num_hops,
        }
    }

    fn base(&self) -> &SegmentBase {
        match self {
            Segment::Dst(b)
            | Segment::TrToSrc(b)
            | Segment::Rr(b)
            | Segment::TsAdj(b)
            | Segment::DstSym { base: b, .. }
            | Segment::SpoofRr { base: b, .. }
            | Segment::SpoofTsAdj { base: b, .. }
            | Segment::SpoofTsAdjTsZero { base: b, .. }
            | Segment::SpoofTsAdjTsZeroDoubleStamp { base: b, .. } => b,
        }
    }

    fn base_mut(&mut self) -> &mut SegmentBase {
        match self {
            Segment::Dst(b)
            | Segment::TrToSrc(b)
            | Segment::Rr(b)
            | Segment::TsAdj(b)
            | Segment::DstSym { base: b, .. }
            | Segment::SpoofRr { base: b, .. }
            | Segment::SpoofTsAdj { base: b, .. }
            | Segment::SpoofTsAdjTsZero { base: b, .. }
            | Segment::SpoofTsAdjTsZeroDoubleStamp { base: b, .. } => b,
        }
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Dst(_) => SegmentKind::DstRev,
            Segment::DstSym { .. } => SegmentKind::DstSymRev,
            Segment::TrToSrc(_) => SegmentKind::TrToSrcRev,
            Segment::Rr(_) => SegmentKind::RrRev,
            Segment::SpoofRr { .. } => SegmentKind::SpoofRrRev,
            Segment::TsAdj(_) => SegmentKind::TsAdjRev,
            Segment::SpoofTsAdj { .. } => SegmentKind::SpoofTsAdjRev,
            Segment::SpoofTsAdjTsZero { .. } => SegmentKind::SpoofTsAdjRevTsZero,
            Segment::SpoofTsAdjTsZeroDoubleStamp { .. } => {
                SegmentKind::SpoofTsAdjRevTsZeroDoubleStamp
            }
        }
    }

    /// The vantage point that spoofed the producing probe, if any.
    pub fn spoofer(&self) -> Option<Hop> {
        match self {
            Segment::SpoofRr { spoofer, .. }
            | Segment::SpoofTsAdj { spoofer, .. }
            | Segment::SpoofTsAdjTsZero { spoofer, .. }
            | Segment::SpoofTsAdjTsZeroDoubleStamp { spoofer, .. } => Some(*spoofer),
            _ => None,
        }
    }

    pub fn is_dst_sym(&self) -> bool {
        matches!(self, Segment::DstSym { .. })
    }

    pub fn hops(&self) -> &[Hop] {
        &self.base().hops
    }

    pub fn src(&self) -> Hop {
        self.base().src
    }

    pub fn target(&self) -> Hop {
        self.base().target
    }

    /// The hop closest to the source, i.e. the frontier this segment pushes
    /// the path to. `None` once removal has emptied the segment.
    pub fn last_hop(&self) -> Option<Hop> {
        self.base().hops.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.base().hops.is_empty()
    }

    pub fn length(&self, exclude_unknown: bool) -> usize {
        if exclude_unknown {
            self.base().hops.iter().filter(|h| !h.is_unknown()).count()
        } else {
            self.base().hops.len()
        }
    }

    /// How many hops of this segment rest on a symmetry assumption rather
    /// than a measurement.
    pub fn symmetric_assumptions(&self) -> usize {
        match self {
            Segment::DstSym { num_hops, .. } => *num_hops,
            _ => 0,
        }
    }

    /// Whether the segment's frontier is the source (up to cluster
    /// identity).
    pub fn reaches(&self, cm: &ClusterMap) -> bool {
        match self.last_hop() {
            Some(last) => last == self.base().src || cm.same(last, self.base().src),
            None => false,
        }
    }

    /// Trims the segment so it contains none of `to_del`: everything up to
    /// and including the rightmost hop cluster-matching a deleted hop is
    /// dropped. Unknown hops in `to_del` are ignored. Errors if a match
    /// somehow survives, since grafting the segment would then loop.
    pub fn remove_hops(&mut self, to_del: &[Hop], cm: &ClusterMap) -> Result<(), LoopError> {
        let del: Vec<Hop> = to_del.iter().copied().filter(|h| !h.is_unknown()).collect();
        if del.is_empty() {
            return Ok(());
        }
        let matches = |hop: Hop| del.iter().any(|d| cm.same(*d, hop));
        let rightmost = self
            .base()
            .hops
            .iter()
            .rposition(|h| !h.is_unknown() && matches(*h));
        if let Some(idx) = rightmost {
            let base = self.base_mut();
            base.hops.drain(..=idx);
        }
        if let Some(bad) = self.base().hops.iter().find(|h| !h.is_unknown() && matches(**h)) {
            return Err(LoopError {
                hops: vec![*bad],
                segment: self.base().hops.clone(),
            });
        }
        Ok(())
    }

    /// Extends an assumed-symmetric segment by one more forward hop. The
    /// segment is rebuilt from its stored trace, so previously skipped
    /// unknown or ignored hops are recounted. No-op on other variants.
    pub fn add_sym_hop(&mut self, ignore: &[Hop]) {
        if let Segment::DstSym {
            base,
            trace,
            num_hops,
        } = self
        {
            *num_hops += 1;
            let hops = select_nonzero_hops(&reversed_walk(base.src, trace), *num_hops, ignore);
            base.hops = hops.into_iter().map(Hop::normalized).collect();
        }
    }

    /// Preference ranking used when grafting candidates. Candidates sort
    /// ascending and are pushed in that order, so the greatest candidate
    /// lands on top of the path stack and is explored first. Assumed
    /// symmetry ranks below every measurement; ties prefer segments that
    /// reach the source, then longer measured runs, then larger last hops.
    pub fn order_against(&self, other: &Segment, cm: &ClusterMap) -> Ordering {
        match (self.is_dst_sym(), other.is_dst_sym()) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        if self.hops() == other.hops() {
            return Ordering::Equal;
        }
        if self.last_hop() == other.last_hop() {
            let (a, b) = (self.length(true), other.length(true));
            if a != b {
                return a.cmp(&b);
            }
            return order_hop_slices(self.hops(), other.hops());
        }
        match (self.reaches(cm), other.reaches(cm)) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        let (a, b) = (self.length(true), other.length(true));
        if a != b {
            return a.cmp(&b);
        }
        self.last_hop().cmp(&other.last_hop())
    }
}

/// Length first, then elementwise.
fn order_hop_slices(left: &[Hop], right: &[Hop]) -> Ordering {
    left.len()
        .cmp(&right.len())
        .then_with(|| left.cmp(right))
}

/// The forward trace turned into the walk the reverse path would take under
/// symmetry: source first, destinationward hops after, then reversed.
fn reversed_walk(src: Hop, trace: &[Hop]) -> Vec<Hop> {
    let mut walk = vec![src];
    if !trace.is_empty() {
        walk.extend_from_slice(&trace[..trace.len() - 1]);
    }
    walk.reverse();
    walk
}

/// Shortest prefix of `rev` containing `wanted` countable hops, where
/// unknown hops and ignored hops pass through uncounted. Falls back to the
/// whole walk trimmed of trailing unknowns when not enough hops exist.
fn select_nonzero_hops(rev: &[Hop], wanted: usize, ignore: &[Hop]) -> Vec<Hop> {
    let mut found = 0usize;
    let mut i = 0usize;
    while found < wanted && i < rev.len() {
        if !rev[i].is_unknown() && !ignore.contains(&rev[i]) {
            found += 1;
        }
        i += 1;
    }
    if found == wanted {
        return rev[..i].to_vec();
    }
    let last_valid = rev.iter().rposition(|h| !h.is_unknown());
    match last_valid {
        Some(lv) => rev[..=lv].to_vec(),
        None => Vec::new(),
    }
}
