//! Result data structures for measurement sessions.
//!
//! This module provides the metric shapes produced by the probes, the raw
//! samples that feed the statistics layer, and the final
//! [`SpeedTestResult`] record written once per session. All structures
//! implement Serialize for JSON output.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::TestConfiguration;
use crate::validation::ValidationReport;

/// Where a throughput metric came from.
///
/// Simulated metrics have the same shape as measured ones; this flag is
/// the only way downstream code can tell them apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricSource {
    /// Produced by streaming bytes over a real connection.
    #[default]
    Measured,
    /// Substituted because the endpoint could not be reached.
    Simulated,
}

/// Aggregated throughput metrics for one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedMetrics {
    /// Mean of the per-run speeds in Mbps
    pub speed_mbps: f64,
    /// Total bytes moved across all runs
    pub bytes_transferred: u64,
    /// Total streaming time across all runs in seconds
    pub duration_seconds: f64,
    /// Successful runs aggregated into these metrics
    pub runs: u32,
    /// Fastest single run in Mbps
    pub peak_speed_mbps: f64,
    /// Mean of the per-run speeds in Mbps
    pub average_speed_mbps: f64,
    /// Run-to-run consistency, 0 to 100
    pub stability_score: f64,
    #[serde(skip)]
    pub source: MetricSource,
    /// Set when any run's streaming time was clamped to the floor.
    #[serde(skip)]
    pub suspect: bool,
}

impl SpeedMetrics {
    /// Whether these metrics were simulated rather than measured.
    pub fn is_simulated(&self) -> bool {
        self.source == MetricSource::Simulated
    }

    /// Mean streaming time of a single run in seconds.
    pub fn run_duration_seconds(&self) -> f64 {
        self.duration_seconds / f64::from(self.runs.max(1))
    }
}

/// Latency, jitter, loss and connection timing for one host.
///
/// A `ping_ms` of `-1` marks a failed probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyMetrics {
    /// Mean TCP connect time of the successful samples in milliseconds
    pub ping_ms: f64,
    /// RMS of consecutive sample differences in milliseconds
    pub jitter_ms: f64,
    /// Share of samples that failed, 0 to 100
    pub packet_loss_percent: f64,
    /// Time to resolve the host in milliseconds
    pub dns_lookup_ms: f64,
    /// TCP handshake time of the detailed pass in milliseconds
    pub tcp_connect_ms: f64,
    /// TLS handshake time of the detailed pass in milliseconds
    pub ssl_handshake_ms: f64,
    /// Time from request line to first response byte in milliseconds
    pub first_byte_ms: f64,
}

impl LatencyMetrics {
    /// Sentinel value for a probe that produced no usable samples.
    pub const FAILED_PING_MS: f64 = -1.0;

    /// Metrics for a probe that failed before any sample succeeded.
    pub fn failed() -> Self {
        Self {
            ping_ms: Self::FAILED_PING_MS,
            jitter_ms: 0.0,
            packet_loss_percent: 100.0,
            dns_lookup_ms: 0.0,
            tcp_connect_ms: -1.0,
            ssl_handshake_ms: -1.0,
            first_byte_ms: -1.0,
        }
    }

    /// Whether this is the failed-probe sentinel.
    pub fn is_failed(&self) -> bool {
        self.ping_ms < 0.0
    }
}

/// What a raw sample measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementType {
    DownloadSpeed,
    UploadSpeed,
    Latency,
    Jitter,
    PacketLoss,
}

/// A single timestamped sample feeding the statistics layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMeasurement {
    /// 1-indexed run number within its phase
    pub run_number: u32,
    pub timestamp: DateTime<Utc>,
    pub measurement_type: MeasurementType,
    pub value: f64,
}

impl RawMeasurement {
    /// Create a sample stamped with the current time.
    pub fn new(
        run_number: u32,
        measurement_type: MeasurementType,
        value: f64,
    ) -> Self {
        Self { run_number, timestamp: Utc::now(), measurement_type, value }
    }
}

/// Descriptive statistics for one series of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    /// Population standard deviation
    pub standard_deviation: f64,
}

/// Statistics for one measurement type plus derived scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    #[serde(flatten)]
    pub statistics: Statistics,
    pub stability_score: f64,
    /// Half-width of the 95% confidence interval around the mean
    pub confidence_interval: f64,
}

/// Per-type statistics computed during the analysis phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatisticalSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_stats: Option<SeriesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_stats: Option<SeriesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_stats: Option<SeriesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_stats: Option<SeriesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_stats: Option<SeriesSummary>,
}

/// The final record of a completed session.
///
/// Written exactly once, at the end of the analysis phase.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedTestResult {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub config: TestConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_metrics: Option<SpeedMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_metrics: Option<SpeedMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_metrics: Option<LatencyMetrics>,
    pub statistical_summary: StatisticalSummary,
    pub raw_measurements: Vec<RawMeasurement>,
    pub validation: ValidationReport,
}

impl SpeedTestResult {
    /// A compact view of the headline numbers for status polling.
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            download_mbps: self.download_metrics.as_ref().map(|m| m.speed_mbps),
            upload_mbps: self.upload_metrics.as_ref().map(|m| m.speed_mbps),
            ping_ms: self
                .latency_metrics
                .as_ref()
                .filter(|m| !m.is_failed())
                .map(|m| m.ping_ms),
            jitter_ms: self
                .latency_metrics
                .as_ref()
                .filter(|m| !m.is_failed())
                .map(|m| m.jitter_ms),
            valid: self.validation.valid,
        }
    }
}

/// Headline numbers of a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    pub valid: bool,
}
