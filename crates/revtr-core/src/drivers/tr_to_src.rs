//! Atlas intersection: graft the tail of a measured forward traceroute.
//!
//! For every public hop on the frontier segment we ask the atlas whether any
//! fresh traceroute toward the source passes through it. A hit hands us a
//! measured reverse path for free; a token means the atlas is probing on our
//! behalf and we should ask again later.

use std::time::Duration;

use futures::StreamExt;
use tokio::time;
use tracing::debug;

use revtr_types::{AtlasPath, Hop, IntersectionRequest, IntersectionResponse};

use crate::clustermap::ClusterMap;
use crate::drivers::DriverError;
use crate::engine::Deps;
use crate::revtr::ReverseTraceroute;
use crate::segment::Segment;

/// Turns an atlas answer into a graftable segment. The stored traceroute may
/// carry hops before the intersection; those belong to the forward direction
/// and are stripped, keeping the tail from the matched hop through the
/// source.
fn segment_from_atlas_path(src: Hop, path: &AtlasPath, cm: &ClusterMap) -> Option<Segment> {
    let start = path.hops.iter().position(|&h| cm.same(h, path.address))?;
    let hops = path.hops[start..].to_vec();
    if hops.is_empty() {
        return None;
    }
    Some(Segment::tr_to_src(hops, src, path.address))
}

/// Queries the atlas for every public hop of the frontier segment. Ok means
/// a path was found and grafted; tokens handed back are stashed on the run
/// for later redemption.
pub async fn reverse_hops_tr_to_src(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
) -> Result<(), DriverError> {
    let hops: Vec<Hop> = match rt.curr_path().last_seg() {
        Some(seg) => seg
            .hops()
            .iter()
            .copied()
            .filter(|h| !h.is_unknown() && !h.is_private())
            .collect(),
        None => Vec::new(),
    };
    if hops.is_empty() {
        return Err(DriverError::NoHopFound);
    }
    let staleness = deps.config.staleness_or_default(rt.staleness_minutes);
    let requests: Vec<IntersectionRequest> = hops
        .iter()
        .map(|&hop| IntersectionRequest {
            address: hop,
            dest: rt.src,
            staleness_minutes: staleness,
            use_aliases: true,
            ignore_source: false,
            src: rt.dst,
        })
        .collect();
    let stream = match deps.atlas.get_intersecting_path(requests).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "atlas intersection request failed");
            return Err(DriverError::NoHopFound);
        }
    };
    drain_intersections(rt, deps, stream).await
}

/// Redeems outstanding atlas tokens. Tokens are consumed whether or not the
/// atlas has an answer yet; unresolved ones come back as fresh tokens.
pub async fn collect_background_trs(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
) -> Result<(), DriverError> {
    let tokens = rt.take_tokens();
    if tokens.is_empty() {
        return Err(DriverError::NoHopFound);
    }
    debug!(id = rt.id, count = tokens.len(), "redeeming atlas tokens");
    let stream = match deps.atlas.get_paths_with_token(tokens).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "atlas token redemption failed");
            return Err(DriverError::NoHopFound);
        }
    };
    drain_intersections(rt, deps, stream).await
}

async fn drain_intersections(
    rt: &mut ReverseTraceroute,
    deps: &Deps,
    mut stream: futures::stream::BoxStream<
        'static,
        Result<IntersectionResponse, revtr_types::AtlasError>,
    >,
) -> Result<(), DriverError> {
    let timeout = Duration::from_secs(deps.config.atlas_timeout_secs);
    let cm = rt.cluster_map().clone();
    loop {
        let item = match time::timeout(timeout, stream.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                debug!(id = rt.id, "atlas response timed out");
                break;
            }
        };
        match item {
            Ok(IntersectionResponse::Path(path)) => {
                debug!(id = rt.id, address = %path.address, "atlas intersection hit");
                if let Some(seg) = segment_from_atlas_path(rt.src, &path, &cm) {
                    if rt.add_background_tr_segment(seg) {
                        return Ok(());
                    }
                }
            }
            Ok(IntersectionResponse::Token(token)) => {
                rt.tokens.push(token);
            }
            Ok(IntersectionResponse::NoneFound) => {}
            Ok(IntersectionResponse::Error(e)) => {
                debug!(id = rt.id, error = %e, "atlas answered with an error");
            }
            Err(e) => {
                debug!(id = rt.id, error = %e, "atlas stream broke");
                break;
            }
        }
    }
    Err(DriverError::NoHopFound)
}
