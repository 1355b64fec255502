//! Vantage point roster, capability probing, and spoofer ranking.
//!
//! Reverse traceroute needs vantage points that can actually do what a
//! technique asks of them: fill record-route slots, get timestamp options
//! stamped, transmit spoofed packets, receive replies to someone else's
//! spoofed packets. This crate keeps the roster, rechecks capabilities on
//! a cycle, quarantines vantage points that go dark, and serves the
//! rankings the engine's drivers ask for.

pub mod capabilities;
pub mod quarantine;
pub mod service;

pub use capabilities::{CapabilityConfig, CapabilityProber};
pub use quarantine::{Quarantine, DEFAULT_QUARANTINE_DAYS};
pub use service::VpService;
