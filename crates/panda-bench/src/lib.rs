//! Loopback throughput bench for the panda over WiFi.
//!
//! - [`timing`] sends a batch of frames and measures how fast it completes
//! - [`udp_drop`] runs the full loopback regression procedure and reports
//!   per-burst throughput

pub mod timing;
pub mod udp_drop;

pub use timing::{saturation_pct, time_many_sends, BatchOutcome};
pub use udp_drop::{run_udp_doesnt_drop, BurstReport, Sample, UdpDropReport};
