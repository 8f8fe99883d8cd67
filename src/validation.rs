//! Sanity checks on measured metrics.
//!
//! The validator only catches results that are internally inconsistent or
//! out of range; it cannot detect a client that fabricates a consistent set
//! of numbers. The thresholds are heuristics and are configurable through
//! [`ValidationThresholds`].

use log::warn;
use serde::Serialize;

use crate::errors::NetgaugeError;
use crate::measurements::expected_bytes;
use crate::results::{LatencyMetrics, SpeedMetrics};

/// Bounds applied by [`ResultValidator`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationThresholds {
    /// Speeds above this are rejected.
    /// Default: 10,000 Mbps
    pub max_speed_mbps: f64,
    /// Speeds above this are accepted with a warning.
    /// Default: 1,000 Mbps
    pub warn_speed_mbps: f64,
    /// Default: 0.1 s
    pub min_duration_seconds: f64,
    /// Default: 120 s
    pub max_duration_seconds: f64,
    /// Allowed relative deviation of the byte count from
    /// `speed * duration`.
    /// Default: 0.5
    pub byte_tolerance: f64,
    /// Default: 0.1 ms
    pub min_ping_ms: f64,
    /// Default: 10,000 ms
    pub max_ping_ms: f64,
    /// Jitter may be at most this multiple of the ping.
    /// Default: 2.0
    pub max_jitter_factor: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_speed_mbps: 10_000.0,
            warn_speed_mbps: 1_000.0,
            min_duration_seconds: 0.1,
            max_duration_seconds: 120.0,
            byte_tolerance: 0.5,
            min_ping_ms: 0.1,
            max_ping_ms: 10_000.0,
            max_jitter_factor: 2.0,
        }
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub warnings: Vec<String>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self { valid: true, warnings: Vec::new() }
    }
}

impl ValidationReport {
    fn reject(&mut self, warning: String) {
        self.valid = false;
        self.warnings.push(warning);
    }

    /// Turn a rejected report into a validation error listing every
    /// warning.
    pub fn ensure_valid(&self) -> Result<(), NetgaugeError> {
        if self.valid {
            return Ok(());
        }

        Err(NetgaugeError::validation(self.warnings.join("; ")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultValidator {
    thresholds: ValidationThresholds,
}

impl ResultValidator {
    pub fn new(thresholds: ValidationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ValidationThresholds {
        &self.thresholds
    }

    /// Check every metric group that is present. Absent groups are skipped
    /// and never affect validity.
    pub fn validate(
        &self,
        download: Option<&SpeedMetrics>,
        upload: Option<&SpeedMetrics>,
        latency: Option<&LatencyMetrics>,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        if let Some(metrics) = download {
            self.check_speed(metrics, "download", &mut report);
        }

        if let Some(metrics) = upload {
            self.check_speed(metrics, "upload", &mut report);
        }

        if let Some(metrics) = latency {
            self.check_latency(metrics, &mut report);
        }

        for warning in &report.warnings {
            warn!("Validation: {}", warning);
        }

        report
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn check_speed(
        &self,
        metrics: &SpeedMetrics,
        direction: &str,
        report: &mut ValidationReport,
    ) {
        let t = &self.thresholds;

        // Negated comparisons so NaN fails every check.
        if !(metrics.speed_mbps >= 0.0
            && metrics.peak_speed_mbps >= 0.0
            && metrics.average_speed_mbps >= 0.0)
        {
            report.reject(format!("{} speed is negative", direction));
        }

        if !(metrics.speed_mbps <= t.max_speed_mbps
            && metrics.peak_speed_mbps <= t.max_speed_mbps)
        {
            report.reject(format!(
                "{} speed exceeds {} Mbps",
                direction, t.max_speed_mbps
            ));
        }

        if !(metrics.peak_speed_mbps >= metrics.average_speed_mbps) {
            report.reject(format!(
                "{} peak speed {:.2} Mbps is below the average {:.2} Mbps",
                direction, metrics.peak_speed_mbps, metrics.average_speed_mbps
            ));
        }

        if !(0.0..=100.0).contains(&metrics.stability_score) {
            report.reject(format!(
                "{} stability score {:.2} is outside 0-100",
                direction, metrics.stability_score
            ));
        }

        // Bounds a single run; the totals are only used for the byte check.
        let run_duration = metrics.run_duration_seconds();
        if !(run_duration >= t.min_duration_seconds
            && run_duration <= t.max_duration_seconds)
        {
            report.reject(format!(
                "{} run duration {:.2}s is outside {}-{}s",
                direction,
                run_duration,
                t.min_duration_seconds,
                t.max_duration_seconds
            ));
        }

        let expected =
            expected_bytes(metrics.speed_mbps, metrics.duration_seconds);
        let min = expected * (1.0 - t.byte_tolerance);
        let max = expected * (1.0 + t.byte_tolerance);
        let bytes = metrics.bytes_transferred as f64;
        if !(bytes >= min && bytes <= max) {
            report.reject(format!(
                "{} transferred {} bytes, expected about {:.0} for {:.2} Mbps over {:.2}s",
                direction,
                metrics.bytes_transferred,
                expected,
                metrics.speed_mbps,
                metrics.duration_seconds
            ));
        }

        if metrics.speed_mbps > t.warn_speed_mbps {
            report.warnings.push(format!(
                "{} speed over {} Mbps detected: {:.2} Mbps",
                direction, t.warn_speed_mbps, metrics.speed_mbps
            ));
        }
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn check_latency(
        &self,
        metrics: &LatencyMetrics,
        report: &mut ValidationReport,
    ) {
        let t = &self.thresholds;

        if metrics.is_failed() {
            report.reject("latency probe failed".to_string());
            return;
        }

        if !(metrics.ping_ms >= t.min_ping_ms && metrics.ping_ms <= t.max_ping_ms)
        {
            report.reject(format!(
                "ping {:.3} ms is outside {}-{} ms",
                metrics.ping_ms, t.min_ping_ms, t.max_ping_ms
            ));
        }

        if !(metrics.jitter_ms >= 0.0
            && metrics.jitter_ms <= metrics.ping_ms * t.max_jitter_factor)
        {
            report.reject(format!(
                "jitter {:.3} ms exceeds {} x ping",
                metrics.jitter_ms, t.max_jitter_factor
            ));
        }

        if !(0.0..=100.0).contains(&metrics.packet_loss_percent) {
            report.reject(format!(
                "packet loss {:.2}% is outside 0-100",
                metrics.packet_loss_percent
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::BYTES_PER_MIB;
    use crate::probes::throughput::{aggregate, RunOutcome};
    use crate::results::MetricSource;
    use proptest::prelude::*;
    use std::time::Duration;

    fn speed(speed_mbps: f64, duration_seconds: f64, bytes: u64) -> SpeedMetrics {
        SpeedMetrics {
            speed_mbps,
            bytes_transferred: bytes,
            duration_seconds,
            runs: 1,
            peak_speed_mbps: speed_mbps,
            average_speed_mbps: speed_mbps,
            stability_score: 100.0,
            source: MetricSource::Measured,
            suspect: false,
        }
    }

    fn latency(ping_ms: f64, jitter_ms: f64) -> LatencyMetrics {
        LatencyMetrics {
            ping_ms,
            jitter_ms,
            packet_loss_percent: 0.0,
            dns_lookup_ms: 1.0,
            tcp_connect_ms: ping_ms,
            ssl_handshake_ms: 0.0,
            first_byte_ms: ping_ms,
        }
    }

    #[test]
    fn test_rejects_inconsistent_bytes() {
        let validator = ResultValidator::default();
        let report = validator.validate(Some(&speed(50.0, 10.0, 1)), None, None);
        assert!(!report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("download"));
    }

    #[test]
    fn test_accepts_bytes_within_tolerance() {
        let validator = ResultValidator::default();
        let exact = (62.5 * BYTES_PER_MIB) as u64;

        for bytes in [exact, exact * 14 / 10, exact * 6 / 10] {
            let report =
                validator.validate(Some(&speed(50.0, 10.0, bytes)), None, None);
            assert!(report.valid, "{} bytes should be accepted", bytes);
            assert!(report.warnings.is_empty());
        }

        let report = validator.validate(
            Some(&speed(50.0, 10.0, exact * 16 / 10)),
            None,
            None,
        );
        assert!(!report.valid);
    }

    #[test]
    fn test_rejects_ping_out_of_range() {
        let validator = ResultValidator::default();
        assert!(!validator.validate(None, None, Some(&latency(0.05, 0.0))).valid);
        assert!(!validator.validate(None, None, Some(&latency(15_000.0, 0.0))).valid);
        assert!(validator.validate(None, None, Some(&latency(12.0, 3.0))).valid);
    }

    #[test]
    fn test_rejects_excessive_jitter() {
        let validator = ResultValidator::default();
        let report = validator.validate(None, None, Some(&latency(10.0, 25.0)));
        assert!(!report.valid);
        assert!(report.warnings[0].contains("jitter"));
    }

    #[test]
    fn test_rejects_failed_latency_sentinel() {
        let validator = ResultValidator::default();
        let report =
            validator.validate(None, None, Some(&LatencyMetrics::failed()));
        assert!(!report.valid);
    }

    #[test]
    fn test_rejects_peak_below_average() {
        let validator = ResultValidator::default();
        let mut metrics = speed(50.0, 10.0, (62.5 * BYTES_PER_MIB) as u64);
        metrics.peak_speed_mbps = 40.0;
        assert!(!validator.validate(Some(&metrics), None, None).valid);
    }

    #[test]
    fn test_rejects_duration_out_of_range() {
        let validator = ResultValidator::default();
        let bytes = (50.0 * 200.0 * BYTES_PER_MIB / 8.0) as u64;
        let report =
            validator.validate(None, Some(&speed(50.0, 200.0, bytes)), None);
        assert!(!report.valid);
        assert!(report.warnings[0].contains("upload"));
    }

    #[test]
    fn test_ensure_valid() {
        let validator = ResultValidator::default();
        let accepted = validator.validate(None, None, Some(&latency(12.0, 3.0)));
        assert!(accepted.ensure_valid().is_ok());

        let rejected = validator.validate(None, None, Some(&LatencyMetrics::failed()));
        let error = rejected.ensure_valid().unwrap_err();
        assert_eq!(error.kind, crate::errors::ErrorKind::Validation);
        assert_eq!(error.exit_code(), crate::errors::exit_codes::VALIDATION_ERROR);
        assert_eq!(error.message, "latency probe failed");
    }

    #[test]
    fn test_duration_bound_applies_per_run() {
        let validator = ResultValidator::default();
        let run = Duration::from_secs(60);
        let bytes = (100.0 * 60.0 * BYTES_PER_MIB / 8.0) as u64;
        let outcomes: Vec<RunOutcome> = (0..3)
            .map(|_| RunOutcome::from_transfer(bytes, run, Duration::from_millis(100)))
            .collect();

        let metrics = aggregate(&outcomes, MetricSource::Measured).unwrap();
        assert_eq!(metrics.runs, 3);
        assert!((metrics.duration_seconds - 180.0).abs() < 1e-9);

        let report = validator.validate(Some(&metrics), Some(&metrics), None);
        assert!(report.valid, "{:?}", report.warnings);

        // Ten runs of 130s each still exceed the single-run ceiling.
        let long = RunOutcome::from_transfer(bytes, Duration::from_secs(130), Duration::ZERO);
        let metrics = aggregate(&[long; 10], MetricSource::Measured).unwrap();
        let report = validator.validate(Some(&metrics), None, None);
        assert!(!report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("run duration")));
    }

    #[test]
    fn test_rejects_nan_speed() {
        let validator = ResultValidator::default();
        let report = validator.validate(Some(&speed(f64::NAN, 10.0, 0)), None, None);
        assert!(!report.valid);
    }

    #[test]
    fn test_high_speed_is_a_warning_only() {
        let validator = ResultValidator::default();
        let bytes = (2_000.0 * 10.0 * BYTES_PER_MIB / 8.0) as u64;
        let report =
            validator.validate(Some(&speed(2_000.0, 10.0, bytes)), None, None);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_absent_groups_are_skipped() {
        let report = ResultValidator::default().validate(None, None, None);
        assert!(report.valid);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let validator = ResultValidator::new(ValidationThresholds {
            byte_tolerance: 0.01,
            ..Default::default()
        });
        let bytes = (62.5 * BYTES_PER_MIB * 1.1) as u64;
        assert!(!validator.validate(Some(&speed(50.0, 10.0, bytes)), None, None).valid);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: metrics whose bytes are reconstructed from speed and
        /// duration always pass the speed checks.
        #[test]
        fn consistent_speed_metrics_are_valid(
            speed_mbps in 0.1f64..1_000.0f64,
            duration in 0.1f64..120.0f64,
        ) {
            let bytes = expected_bytes(speed_mbps, duration) as u64;
            let report = ResultValidator::default()
                .validate(Some(&speed(speed_mbps, duration, bytes)), None, None);
            prop_assert!(report.valid);
        }

        /// Property: any ping in range with jitter at most twice the ping
        /// is valid.
        #[test]
        fn in_range_latency_is_valid(
            ping in 0.1f64..10_000.0f64,
            jitter_ratio in 0.0f64..2.0f64,
        ) {
            let report = ResultValidator::default()
                .validate(None, None, Some(&latency(ping, ping * jitter_ratio)));
            prop_assert!(report.valid);
        }
    }
}
