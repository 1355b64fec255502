//! Engine tuning knobs.
//!
//! Defaults match long-running production values; everything can be
//! overridden from the environment (`REVTR_*`) so deployments don't need a
//! config file for one-off tuning.

use std::env;

use revtr_types::Hop;

/// A stable, stamping-but-boring address used as filler in timestamp
/// probes. It never appears near probed paths, so a stamp against it is
/// diagnostic.
pub const DUMMY_IP: &str = "128.208.3.77";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Spoofed record-route probes to send per target per batch.
    pub rr_rate_limit: usize,
    /// Adjacencies to test per timestamp batch.
    pub ts_rate_limit: usize,
    /// Spoofed probes a target may ignore before it is written off.
    pub max_unresponsive: i32,
    /// Cap on candidate adjacencies fetched per hop.
    pub max_adjacents: usize,
    /// Result-cache staleness accepted when the caller does not specify.
    pub default_staleness_minutes: i64,
    /// Re-test stamps that look like the kernel double-stamp bug before
    /// discarding them.
    pub linux_bug_retest: bool,
    pub dummy_ip: Hop,
    pub rr_timeout_secs: u64,
    pub spoof_timeout_secs: u64,
    pub ts_timeout_secs: u64,
    pub spoof_ts_timeout_secs: u64,
    pub traceroute_timeout_secs: u64,
    pub traceroute_attempts: u32,
    pub traceroute_wait_secs: u32,
    /// Ceiling on waiting for one atlas response.
    pub atlas_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rr_rate_limit: 5,
            ts_rate_limit: 1,
            max_unresponsive: 10,
            max_adjacents: 30,
            default_staleness_minutes: 60,
            linux_bug_retest: true,
            dummy_ip: DUMMY_IP.parse().unwrap_or(Hop::UNKNOWN),
            rr_timeout_secs: 30,
            spoof_timeout_secs: 10,
            ts_timeout_secs: 10,
            spoof_ts_timeout_secs: 40,
            traceroute_timeout_secs: 30,
            traceroute_attempts: 1,
            traceroute_wait_secs: 2,
            atlas_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `REVTR_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();
        if let Some(v) = env_parse("REVTR_RR_RATE_LIMIT") {
            cfg.rr_rate_limit = v;
        }
        if let Some(v) = env_parse("REVTR_TS_RATE_LIMIT") {
            cfg.ts_rate_limit = v;
        }
        if let Some(v) = env_parse("REVTR_MAX_UNRESPONSIVE") {
            cfg.max_unresponsive = v;
        }
        if let Some(v) = env_parse("REVTR_MAX_ADJACENTS") {
            cfg.max_adjacents = v;
        }
        if let Some(v) = env_parse("REVTR_STALENESS_MINUTES") {
            cfg.default_staleness_minutes = v;
        }
        if let Some(v) = env_parse("REVTR_LINUX_BUG_RETEST") {
            cfg.linux_bug_retest = v;
        }
        if let Ok(v) = env::var("REVTR_DUMMY_IP") {
            if let Ok(ip) = v.parse() {
                cfg.dummy_ip = ip;
            }
        }
        cfg
    }

    /// The staleness to use for a run, falling back to the configured
    /// default when the request says "whatever".
    pub fn staleness_or_default(&self, requested: i64) -> i64 {
        if requested == 0 {
            self.default_staleness_minutes
        } else {
            requested
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
