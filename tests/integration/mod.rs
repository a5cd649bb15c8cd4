//! Integration tests for tpgate
//!
//! Every test runs the real engine against the in-memory kernel and process
//! table, then checks the installed state or walks synthetic packets
//! through the installed rules.
//!
//! # Test Organization
//!
//! - `support`: fixtures (list files in a temp dir) and the packet walker
//! - `lifecycle`: start/stop/restart behavior against live state
//! - `classification`: packet verdicts per mode, family and strategy

pub mod classification;
pub mod lifecycle;
pub mod support;
