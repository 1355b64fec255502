//! The vantage point roster and spoofer rankings.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use revtr_types::{Hop, VantagePoint, VpError, VpSource};

use crate::quarantine::Quarantine;

#[derive(Default)]
struct Roster {
    vps: HashMap<Hop, VantagePoint>,
    quarantined: HashMap<Hop, Quarantine>,
    /// Served quarantines, kept so a relapse doubles the term.
    history: HashMap<Hop, Quarantine>,
    /// Known hop counts from a vantage point to a destination /24,
    /// harvested from past record-route probes.
    distances: HashMap<(Hop, u32), u32>,
}

/// In-memory vantage point service. Rankings hand out at most one VP per
/// site so a single flaky hosting site cannot dominate a probe batch.
#[derive(Default)]
pub struct VpService {
    roster: Mutex<Roster>,
}

impl VpService {
    pub fn new() -> Self {
        VpService::default()
    }

    pub fn add_vp(&self, vp: VantagePoint) {
        self.lock().vps.insert(vp.ip, vp);
    }

    pub fn remove_vp(&self, ip: Hop) {
        let mut roster = self.lock();
        roster.vps.remove(&ip);
        roster.quarantined.remove(&ip);
    }

    /// Puts a vantage point in quarantine; a repeat offense doubles the
    /// term it served last time.
    pub fn quarantine(&self, ip: Hop) {
        let now = Utc::now();
        let mut roster = self.lock();
        let term = match roster.history.get(&ip) {
            Some(prev) => prev.again(now),
            None => Quarantine::new(now),
        };
        info!(%ip, days = term.days, "quarantining vantage point");
        roster.history.insert(ip, term);
        roster.quarantined.insert(ip, term);
    }

    pub fn is_quarantined(&self, ip: Hop) -> bool {
        self.lock().quarantined.contains_key(&ip)
    }

    /// Releases every quarantine whose term has run out; returns the
    /// released addresses.
    pub fn release_expired(&self) -> Vec<Hop> {
        let now = Utc::now();
        let mut roster = self.lock();
        let released: Vec<Hop> = roster
            .quarantined
            .iter()
            .filter(|(_, q)| q.expired(now))
            .map(|(&ip, _)| ip)
            .collect();
        for ip in &released {
            roster.quarantined.remove(ip);
            info!(%ip, "quarantine expired");
        }
        released
    }

    pub fn record_distance(&self, vp: Hop, dest24: u32, hops: u32) {
        self.lock().distances.insert((vp, dest24), hops);
    }

    /// Replaces a vantage point's probed capabilities.
    pub fn update_capabilities(&self, vp: VantagePoint) {
        self.lock().vps.insert(vp.ip, vp);
    }

    /// The least recently capability-checked active VPs, oldest first.
    pub fn stalest_vps(&self, count: usize) -> Vec<VantagePoint> {
        let roster = self.lock();
        let mut active: Vec<VantagePoint> = roster
            .vps
            .values()
            .filter(|vp| !roster.quarantined.contains_key(&vp.ip))
            .cloned()
            .collect();
        active.sort_by_key(|vp| vp.last_check);
        active.truncate(count);
        active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Roster> {
        match self.roster.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn ranked(
        &self,
        target: Hop,
        max: usize,
        capability: impl Fn(&VantagePoint) -> bool,
    ) -> Vec<VantagePoint> {
        let roster = self.lock();
        let dest24 = target.prefix24();
        let mut candidates: Vec<(Option<u32>, VantagePoint)> = roster
            .vps
            .values()
            .filter(|vp| capability(vp) && !roster.quarantined.contains_key(&vp.ip))
            .map(|vp| (roster.distances.get(&(vp.ip, dest24)).copied(), vp.clone()))
            .collect();
        // Farther spoofers first: their forward path to the target is less
        // likely to overlap the reverse path under test. Unknown distances
        // rank after every known one; ties break on address for stable
        // output.
        candidates.sort_by(|(da, a), (db, b)| match (da, db) {
            (Some(da), Some(db)) => db.cmp(da).then(a.ip.cmp(&b.ip)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.ip.cmp(&b.ip),
        });
        let mut seen_sites = HashSet::new();
        let mut out: Vec<VantagePoint> = candidates
            .into_iter()
            .map(|(_, vp)| vp)
            .filter(|vp| seen_sites.insert(vp.site.clone()))
            .collect();
        if max > 0 {
            out.truncate(max);
        }
        out
    }
}

#[async_trait]
impl VpSource for VpService {
    async fn get_vps(&self) -> Result<Vec<VantagePoint>, VpError> {
        let roster = self.lock();
        Ok(roster
            .vps
            .values()
            .filter(|vp| !roster.quarantined.contains_key(&vp.ip))
            .cloned()
            .collect())
    }

    async fn get_rr_spoofers(&self, target: Hop, max: usize) -> Result<Vec<VantagePoint>, VpError> {
        Ok(self.ranked(target, max, |vp| vp.record_route && vp.can_spoof))
    }

    async fn get_ts_spoofers(&self, target: Hop, max: usize) -> Result<Vec<VantagePoint>, VpError> {
        Ok(self.ranked(target, max, |vp| vp.timestamp && vp.can_spoof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

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

    #[tokio::test]
    async fn rr_spoofers_rank_by_descending_distance_unknown_last() {
        let svc = VpService::new();
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.add_vp(vp("1.0.0.2", "b"));
        svc.add_vp(vp("1.0.0.3", "c"));
        let target = h("8.8.8.8");
        svc.record_distance(h("1.0.0.1"), target.prefix24(), 4);
        svc.record_distance(h("1.0.0.2"), target.prefix24(), 11);

        let ranked = svc.get_rr_spoofers(target, 0).await.unwrap();
        let ips: Vec<Hop> = ranked.iter().map(|v| v.ip).collect();
        assert_eq!(ips, vec![h("1.0.0.2"), h("1.0.0.1"), h("1.0.0.3")]);
    }

    #[tokio::test]
    async fn rankings_hand_out_one_vp_per_site() {
        let svc = VpService::new();
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.add_vp(vp("1.0.0.2", "a"));
        svc.add_vp(vp("1.0.0.3", "b"));

        let ranked = svc.get_ts_spoofers(h("8.8.8.8"), 0).await.unwrap();
        assert_eq!(ranked.len(), 2);
        let sites: HashSet<String> = ranked.iter().map(|v| v.site.clone()).collect();
        assert_eq!(sites.len(), 2);
    }

    #[tokio::test]
    async fn quarantined_vps_are_invisible_until_released() {
        let svc = VpService::new();
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.quarantine(h("1.0.0.1"));
        assert!(svc.get_vps().await.unwrap().is_empty());
        assert!(svc.get_rr_spoofers(h("8.8.8.8"), 0).await.unwrap().is_empty());

        // Backdate the term so the sweep releases it.
        {
            let mut roster = svc.roster.lock().unwrap();
            let q = roster.quarantined.get_mut(&h("1.0.0.1")).unwrap();
            q.since = Utc::now() - Duration::days(8);
        }
        assert_eq!(svc.release_expired(), vec![h("1.0.0.1")]);
        assert_eq!(svc.get_vps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requarantine_doubles_the_term() {
        let svc = VpService::new();
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.quarantine(h("1.0.0.1"));
        {
            let mut roster = svc.roster.lock().unwrap();
            roster.quarantined.get_mut(&h("1.0.0.1")).unwrap().since =
                Utc::now() - Duration::days(8);
        }
        svc.release_expired();
        svc.quarantine(h("1.0.0.1"));
        assert_eq!(svc.roster.lock().unwrap().quarantined[&h("1.0.0.1")].days, 14);
    }

    #[tokio::test]
    async fn capability_filters_apply() {
        let svc = VpService::new();
        let mut no_spoof = vp("1.0.0.1", "a");
        no_spoof.can_spoof = false;
        svc.add_vp(no_spoof);
        let mut no_ts = vp("1.0.0.2", "b");
        no_ts.timestamp = false;
        svc.add_vp(no_ts);

        assert!(svc.get_ts_spoofers(h("8.8.8.8"), 0).await.unwrap().is_empty());
        let rr = svc.get_rr_spoofers(h("8.8.8.8"), 0).await.unwrap();
        assert_eq!(rr.len(), 1);
        assert_eq!(rr[0].ip, h("1.0.0.2"));
    }

    #[tokio::test]
    async fn max_truncates_rankings() {
        let svc = VpService::new();
        svc.add_vp(vp("1.0.0.1", "a"));
        svc.add_vp(vp("1.0.0.2", "b"));
        svc.add_vp(vp("1.0.0.3", "c"));
        assert_eq!(svc.get_rr_spoofers(h("8.8.8.8"), 2).await.unwrap().len(), 2);
    }
}
