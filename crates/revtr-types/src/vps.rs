//! Vantage points and the vantage-point service seam.

use chrono::{DateTime, Utc};

use crate::hop::Hop;

/// A measurement vantage point and its probed capabilities.
#[derive(Debug, Clone)]
pub struct VantagePoint {
    pub ip: Hop,
    pub hostname: String,
    /// Hosting site; rankings hand out at most one VP per site.
    pub site: String,
    pub can_ping: bool,
    pub can_trace: bool,
    /// Record-route probes come back with slots filled.
    pub record_route: bool,
    /// Pre-specified timestamp probes come back stamped.
    pub timestamp: bool,
    /// Can transmit spoofed probes.
    pub can_spoof: bool,
    /// Receives replies to probes spoofed as its address.
    pub receive_spoof: bool,
    pub last_check: DateTime<Utc>,
}

impl VantagePoint {
    /// True when no probe type elicits anything; such a VP is a quarantine
    /// candidate.
    pub fn all_dead(&self) -> bool {
        !self.can_ping
            && !self.can_trace
            && !self.record_route
            && !self.timestamp
            && !self.can_spoof
            && !self.receive_spoof
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VpError {
    #[error("vantage point service unavailable: {0}")]
    Unavailable(String),
}

/// Source of healthy vantage points, ranked for the asking target.
#[async_trait::async_trait]
pub trait VpSource: Send + Sync {
    async fn get_vps(&self) -> Result<Vec<VantagePoint>, VpError>;

    /// Spoofing-capable, record-route-capable VPs ordered by descending
    /// known distance to the target's /24, unknown distances last.
    async fn get_rr_spoofers(
        &self,
        target: Hop,
        max: usize,
    ) -> Result<Vec<VantagePoint>, VpError>;

    /// Spoofing-capable, timestamp-capable VPs for the target.
    async fn get_ts_spoofers(
        &self,
        target: Hop,
        max: usize,
    ) -> Result<Vec<VantagePoint>, VpError>;
}
