//! Common fixtures for the acceptance suite.
//!
//! Provides helpers for:
//! - Locating a real panda (`PANDA_IP`)
//! - Opening a device and its streaming channel
//! - Checking measured throughput against acceptance criteria

use panda_bench::UdpDropReport;
use panda_common::config::{BenchConfig, DeviceDriver, DEFAULT_CONTROL_PORT};
use panda_transport::{Panda, PandaWifiStreaming, SimulatedPanda, SimulatedStream};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Environment variable naming the panda under test.
pub const PANDA_IP_ENV: &str = "PANDA_IP";

/// Throughput window every checked batch must land in.
#[derive(Debug, Clone, Copy)]
pub struct AcceptanceCriteria {
    /// Lower bound in kbps, exclusive.
    pub min_kbps: f64,
    /// Upper bound in kbps, exclusive.
    pub max_kbps: f64,
}

impl Default for AcceptanceCriteria {
    fn default() -> Self {
        // 60% and 100% of 500 kbps, with headroom for measurement overhead
        Self {
            min_kbps: 300.0,
            max_kbps: 500.0,
        }
    }
}

impl AcceptanceCriteria {
    /// Check every checked sample of a report.
    pub fn check(&self, report: &UdpDropReport) -> Result<(), String> {
        for burst in report.bursts.iter().filter(|b| b.checked) {
            for sample in &burst.samples {
                if !(sample.comp_kbps > self.min_kbps && sample.comp_kbps < self.max_kbps) {
                    return Err(format!(
                        "id 0x{:X}: {:.2} kbps outside ({}, {})",
                        sample.msg_id, sample.comp_kbps, self.min_kbps, self.max_kbps
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Bench configuration for the panda named by `PANDA_IP`.
pub fn hardware_config() -> Result<BenchConfig, String> {
    let ip = std::env::var(PANDA_IP_ENV).map_err(|_| format!("{PANDA_IP_ENV} not set"))?;
    let mut config = BenchConfig::default();
    config.device.driver = DeviceDriver::Wifi;
    config.device.ip = ip;
    Ok(config)
}

/// Check that a panda is reachable before running hardware tests.
pub fn check_hardware_prerequisites() -> Result<BenchConfig, String> {
    let config = hardware_config()?;
    let addr = (config.device.ip.as_str(), DEFAULT_CONTROL_PORT)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {e}", config.device.ip))?
        .next()
        .ok_or_else(|| format!("no address for {}", config.device.ip))?;
    TcpStream::connect_timeout(&addr, Duration::from_secs(2))
        .map_err(|e| format!("panda at {addr} unreachable: {e}"))?;
    Ok(config)
}

/// Open a real panda and its streaming channel.
pub fn open_hardware(config: &BenchConfig) -> (Panda, PandaWifiStreaming) {
    let panda = Panda::connect(&config.device).expect("connect to panda");
    let streaming = PandaWifiStreaming::connect(&config.device).expect("open streaming");
    (panda, streaming)
}

/// Open a simulated panda and its streaming channel.
pub fn open_simulated() -> (SimulatedPanda, SimulatedStream) {
    let panda = SimulatedPanda::new();
    let stream = panda.stream();
    (panda, stream)
}
