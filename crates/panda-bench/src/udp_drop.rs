//! The UDP loopback regression procedure.
//!
//! Puts the device in loopback with all output allowed, then runs each
//! configured burst: kick the stream, set the bus speed, send a batch with a
//! fresh arbitration id and time its return. Bursts with
//! [`BurstConfig::check_saturation`] print a line per iteration and fail when
//! the bus saturation leaves the configured band. The others print a `.` per
//! iteration as a burn-in.

use crate::timing::{saturation_pct, time_many_sends};
use panda_common::config::{BenchConfig, BurstConfig};
use panda_common::error::{PandaError, PandaResult};
use panda_common::metrics::{ThroughputStats, ThroughputSummary};
use panda_transport::{CanDevice, CanStream, SafetyMode};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, info, warn};

/// One measured batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Arbitration id of the batch.
    pub msg_id: u32,
    /// Completed throughput in kbps.
    pub comp_kbps: f64,
    /// Throughput as a percentage of bus speed.
    pub saturation_pct: f64,
}

/// Results of one burst.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstReport {
    /// Frames per batch.
    pub msg_count: usize,
    /// Whether saturation bounds were enforced.
    pub checked: bool,
    /// Every completed iteration, in order.
    pub samples: Vec<Sample>,
    /// Aggregate statistics.
    pub summary: ThroughputSummary,
}

/// Results of a full run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpDropReport {
    /// Bus under test.
    pub bus: u8,
    /// Nominal bus speed in kbps.
    pub speed_kbps: u32,
    /// Per-burst results, in configuration order.
    pub bursts: Vec<BurstReport>,
}

impl UdpDropReport {
    /// Total number of batches sent.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.bursts.iter().map(|b| b.samples.len()).sum()
    }
}

/// Run the loopback procedure on `device`, receiving over `stream`.
///
/// Progress goes to `out`.
///
/// # Errors
///
/// Fails with [`PandaError::Config`] before touching the device if `config`
/// does not validate. Otherwise fails on the first transport error, dropped or
/// stray frame, or saturation outside the configured band. Output errors map
/// to [`PandaError::IoError`].
pub fn run_udp_doesnt_drop<D, S, W>(
    device: &mut D,
    stream: &mut S,
    config: &BenchConfig,
    out: &mut W,
) -> PandaResult<UdpDropReport>
where
    D: CanDevice + ?Sized,
    S: CanStream + ?Sized,
    W: Write + ?Sized,
{
    config
        .validate()
        .map_err(|e| PandaError::Config(e.to_string()))?;

    device.set_safety_mode(SafetyMode::AllOutput)?;
    device.set_can_loopback(true)?;

    let stale = stream.can_recv()?;
    if !stale.is_empty() {
        debug!(count = stale.len(), "Drained stale frames");
    }

    let mut report = UdpDropReport {
        bus: config.bus.bus,
        speed_kbps: config.bus.speed_kbps,
        bursts: Vec::with_capacity(config.bursts.len()),
    };
    for burst in &config.bursts {
        report
            .bursts
            .push(run_burst(device, stream, config, burst, out)?);
    }
    Ok(report)
}

fn run_burst<D, S, W>(
    device: &mut D,
    stream: &mut S,
    config: &BenchConfig,
    burst: &BurstConfig,
    out: &mut W,
) -> PandaResult<BurstReport>
where
    D: CanDevice + ?Sized,
    S: CanStream + ?Sized,
    W: Write + ?Sized,
{
    let bus = config.bus.bus;
    let speed = config.bus.speed_kbps;
    let bounds = &config.saturation;
    info!(
        msg_count = burst.msg_count,
        iterations = burst.iterations,
        checked = burst.check_saturation,
        "Starting burst"
    );

    let mut stats = ThroughputStats::new();
    let mut samples = Vec::with_capacity(burst.iterations);
    for i in 0..burst.iterations {
        let msg_id = u32::try_from(i)
            .ok()
            .and_then(|i| config.bus.base_msg_id.checked_add(i))
            .ok_or_else(|| {
                PandaError::Config(format!(
                    "arbitration id 0x{:X} + {i} overflows",
                    config.bus.base_msg_id
                ))
            })?;

        stream.kick()?;
        device.set_can_speed_kbps(bus, speed)?;
        let comp_kbps = time_many_sends(
            device,
            bus,
            stream,
            burst.msg_count,
            msg_id,
            config.recv_timeout,
        )?;
        let pct = saturation_pct(comp_kbps, speed);

        if burst.check_saturation {
            writeln!(
                out,
                "UDP WIFI loopback {} messages at speed {}, comp speed is {:.2}, percent {:.2}",
                burst.msg_count, speed, comp_kbps, pct
            )?;
            if !bounds.contains(pct) {
                warn!(msg_id, comp_kbps, saturation_pct = pct, "Saturation out of bounds");
                return Err(PandaError::SaturationOutOfBounds {
                    msg_count: burst.msg_count,
                    msg_id,
                    saturation_pct: pct,
                    min_pct: bounds.min_pct,
                    max_pct: bounds.max_pct,
                });
            }
        } else {
            write!(out, ".")?;
            out.flush()?;
        }

        stats.record(comp_kbps);
        samples.push(Sample {
            msg_id,
            comp_kbps,
            saturation_pct: pct,
        });
    }
    writeln!(out)?;

    let summary = stats.summary(speed);
    info!(
        msg_count = burst.msg_count,
        samples = summary.samples,
        mean_kbps = summary.mean_kbps,
        "Burst complete"
    );
    Ok(BurstReport {
        msg_count: burst.msg_count,
        checked: burst.check_saturation,
        samples,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use panda_common::config::SaturationBounds;
    use panda_transport::{SimulatedConfig, SimulatedPanda};
    use std::collections::HashSet;

    fn small_config() -> BenchConfig {
        BenchConfig {
            bursts: vec![
                BurstConfig {
                    msg_count: 1,
                    iterations: 8,
                    check_saturation: false,
                },
                BurstConfig {
                    msg_count: 100,
                    iterations: 2,
                    check_saturation: true,
                },
            ],
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_run_configures_device() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();

        run_udp_doesnt_drop(&mut panda, &mut stream, &small_config(), &mut out).unwrap();

        assert_eq!(panda.safety_mode(), SafetyMode::AllOutput);
        assert!(panda.loopback());
        assert_eq!(panda.can_speed_kbps(0), Some(500));
    }

    #[test]
    fn test_output_format() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();

        let report =
            run_udp_doesnt_drop(&mut panda, &mut stream, &small_config(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "........");
        assert_eq!(lines[3], "");
        for line in &lines[1..3] {
            assert!(
                line.starts_with("UDP WIFI loopback 100 messages at speed 500, comp speed is "),
                "{line}"
            );
            assert!(line.contains(", percent "));
        }
        assert!(text.ends_with("\n\n"));
        assert_eq!(report.iterations(), 10);
    }

    #[test]
    fn test_kick_precedes_every_batch() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();

        run_udp_doesnt_drop(&mut panda, &mut stream, &small_config(), &mut out).unwrap();

        // One kick on open, then one per batch
        let batches = panda.sent_batches();
        assert_eq!(batches.len(), 10);
        for (n, batch) in batches.iter().enumerate() {
            assert_eq!(batch.kicks_before, n as u64 + 2);
        }
    }

    #[test]
    fn test_ids_unique_within_burst() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();

        let report =
            run_udp_doesnt_drop(&mut panda, &mut stream, &small_config(), &mut out).unwrap();

        for burst in &report.bursts {
            let ids: HashSet<u32> = burst.samples.iter().map(|s| s.msg_id).collect();
            assert_eq!(ids.len(), burst.samples.len());
            assert_eq!(burst.samples[0].msg_id, 0x100);
        }
        assert_eq!(report.bursts[1].samples[1].msg_id, 0x101);
    }

    #[test]
    fn test_checked_burst_within_bounds() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();

        let report =
            run_udp_doesnt_drop(&mut panda, &mut stream, &small_config(), &mut out).unwrap();

        let checked = &report.bursts[1];
        assert!(checked.checked);
        for sample in &checked.samples {
            assert!(sample.comp_kbps > 300.0 && sample.comp_kbps < 500.0);
            assert!((sample.saturation_pct - sample.comp_kbps / 5.0).abs() < 1e-9);
        }
        assert_eq!(checked.summary.samples, 2);
        // Interframe space keeps the simulated bus clear of line rate
        let max_pct = checked.summary.max_kbps.unwrap() / 5.0;
        assert!(max_pct < 98.0, "max saturation {max_pct}");
    }

    #[test]
    fn test_invalid_config_fails_before_device_setup() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();
        let mut config = small_config();
        config.bus.base_msg_id = u32::MAX;

        let err = run_udp_doesnt_drop(&mut panda, &mut stream, &config, &mut out).unwrap_err();
        assert!(matches!(err, PandaError::Config(_)), "{err:?}");
        assert_eq!(panda.safety_mode(), SafetyMode::NoOutput);
        assert!(panda.sent_batches().is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn test_saturation_out_of_bounds_aborts() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();
        let config = BenchConfig {
            saturation: SaturationBounds {
                min_pct: 0.0,
                max_pct: 1.0,
            },
            ..small_config()
        };

        let err = run_udp_doesnt_drop(&mut panda, &mut stream, &config, &mut out).unwrap_err();
        match err {
            PandaError::SaturationOutOfBounds {
                msg_count,
                msg_id,
                saturation_pct,
                ..
            } => {
                assert_eq!(msg_count, 100);
                assert_eq!(msg_id, 0x100);
                assert!(saturation_pct > 1.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The offending line is printed before the failure
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("UDP WIFI loopback 100 messages"));
    }

    #[test]
    fn test_burn_in_never_asserts() {
        let mut panda = SimulatedPanda::new();
        let mut stream = panda.stream();
        let mut out = Vec::new();
        let config = BenchConfig {
            saturation: SaturationBounds {
                min_pct: 99.0,
                max_pct: 100.0,
            },
            bursts: vec![BurstConfig {
                msg_count: 1,
                iterations: 0x80,
                check_saturation: false,
            }],
            ..BenchConfig::default()
        };

        let report = run_udp_doesnt_drop(&mut panda, &mut stream, &config, &mut out).unwrap();
        assert_eq!(report.iterations(), 0x80);
        assert_eq!(out.iter().filter(|&&b| b == b'.').count(), 0x80);
    }

    #[test]
    fn test_dropped_frames_propagate() {
        let mut panda = SimulatedPanda::with_config(SimulatedConfig {
            drop_every: Some(50),
            ..Default::default()
        });
        let mut stream = panda.stream();
        let mut out = Vec::new();
        let config = BenchConfig {
            recv_timeout: std::time::Duration::from_millis(200),
            ..small_config()
        };

        let err = run_udp_doesnt_drop(&mut panda, &mut stream, &config, &mut out).unwrap_err();
        assert!(matches!(err, PandaError::DroppedFrames { .. }), "{err:?}");
    }
}
