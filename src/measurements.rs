//! Measurement arithmetic shared by the probes and the validator.
//!
//! Throughput is reported in binary megabits per second
//! (`bytes * 8 / 2^20 / seconds`), which is the unit the byte-consistency
//! check in [`crate::validation`] reconstructs.

use std::time::Duration;

/// Bytes in one binary megabyte.
pub const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Calculate speed in Mbps from a byte count and the time spent streaming.
///
/// Returns 0.0 for a zero duration rather than an unbounded value; callers
/// that need a floor clamp the duration before calling.
pub fn calculate_speed_mbps(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }

    (bytes as f64 * 8.0) / BYTES_PER_MIB / secs
}

/// The number of bytes a transfer at `speed_mbps` for `duration_seconds`
/// should have moved.
pub fn expected_bytes(speed_mbps: f64, duration_seconds: f64) -> f64 {
    speed_mbps * duration_seconds * BYTES_PER_MIB / 8.0
}

/// Latency as the arithmetic mean of the successful samples, in ms.
pub fn latency_f64(measurements: &[f64]) -> Option<f64> {
    if measurements.is_empty() {
        return None;
    }

    Some(measurements.iter().sum::<f64>() / measurements.len() as f64)
}

/// Jitter as the root-mean-square of consecutive sample differences.
///
/// Fewer than two samples have no differences and yield 0.0.
pub fn jitter_f64(measurements: &[f64]) -> f64 {
    let squares: Vec<f64> = measurements
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).powi(2))
        .collect();

    if squares.is_empty() {
        return 0.0;
    }

    (squares.iter().sum::<f64>() / squares.len() as f64).sqrt()
}

/// Share of attempted samples that did not succeed, as a percentage.
pub fn packet_loss_percent(attempted: usize, succeeded: usize) -> f64 {
    if attempted == 0 {
        return 0.0;
    }

    let lost = attempted.saturating_sub(succeeded);
    lost as f64 / attempted as f64 * 100.0
}
