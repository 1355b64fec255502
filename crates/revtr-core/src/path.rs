//! A partial reverse path: an ordered list of grafted segments.

use revtr_types::Hop;

use crate::clustermap::ClusterMap;
use crate::segment::Segment;

/// One branch of the search: segments from the destination toward the
/// source, in graft order.
#[derive(Debug, Clone)]
pub struct ReversePath {
    pub src: Hop,
    pub dst: Hop,
    segments: Vec<Segment>,
}

impl ReversePath {
    /// An empty segment list bootstraps to the trivial destination segment.
    pub fn new(src: Hop, dst: Hop, segments: Vec<Segment>) -> Self {
        let segments = if segments.is_empty() {
            vec![Segment::dst(dst, src)]
        } else {
            segments
        };
        ReversePath { src, dst, segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn add(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn pop(&mut self) -> Option<Segment> {
        self.segments.pop()
    }

    pub fn last_seg(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn last_seg_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut()
    }

    /// Every hop along the path, destination first.
    pub fn hops(&self) -> Vec<Hop> {
        self.segments.iter().flat_map(|s| s.hops().iter().copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.length(false)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The current frontier: the hop closest to the source.
    pub fn last_hop(&self) -> Option<Hop> {
        self.segments.iter().rev().find_map(|s| s.last_hop())
    }

    pub fn reaches(&self, cm: &ClusterMap) -> bool {
        self.last_seg().map(|s| s.reaches(cm)).unwrap_or(false)
    }

    pub fn symmetric_assumptions(&self) -> usize {
        self.segments.iter().map(|s| s.symmetric_assumptions()).sum()
    }
}
