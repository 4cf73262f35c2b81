//! Acceptance suite for the UDP loopback regression.
//!
//! - `common`: fixtures and acceptance criteria
//! - `wifi_udp_test`: the regression procedure on hardware and simulator

mod common;
mod wifi_udp_test;
