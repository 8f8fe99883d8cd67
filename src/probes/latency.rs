//! Connect-time latency probe.
//!
//! Latency is sampled as the duration of a TCP handshake to the target, so
//! it works against any listening port without ICMP privileges.

use std::net::IpAddr;
use std::time::Duration;

use log::{debug, info, warn};

use crate::measurements::{jitter_f64, latency_f64, packet_loss_percent};
use crate::probes::connection::{detailed_timing, measure_tcp_latency, resolve_dns};
use crate::results::{LatencyMetrics, MeasurementType, RawMeasurement};

/// Sampling parameters for the latency probe.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyProbeConfig {
    /// Connect samples taken by [`LatencyProbe::measure`].
    /// Default: 10
    pub ping_count: usize,
    /// Pause between consecutive samples.
    /// Default: 100ms
    pub ping_interval: Duration,
    /// Connect timeout per sample.
    /// Default: 5000ms
    pub ping_timeout: Duration,
    /// Pause between the runs of [`LatencyProbe::sample`].
    /// Default: 500ms
    pub sample_interval: Duration,
    /// Ports on which the detailed pass performs a TLS handshake.
    /// Default: 443
    pub tls_ports: Vec<u16>,
}

impl Default for LatencyProbeConfig {
    fn default() -> Self {
        Self {
            ping_count: 10,
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(5000),
            sample_interval: Duration::from_millis(500),
            tls_ports: vec![443],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatencyProbe {
    config: LatencyProbeConfig,
}

impl LatencyProbe {
    pub fn new(config: LatencyProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LatencyProbeConfig {
        &self.config
    }

    /// Measure ping, jitter, loss and connection timing for `host:port`.
    ///
    /// Never fails: a host that cannot be resolved, or that refuses every
    /// sample, yields [`LatencyMetrics::failed`].
    pub async fn measure(&self, host: &str, port: u16) -> LatencyMetrics {
        info!("Measuring latency to {}:{}", host, port);

        let (address, dns_duration) = match resolve_dns(host).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Latency probe could not resolve {}: {}", host, e.message);
                return LatencyMetrics::failed();
            }
        };
        let dns_lookup_ms = dns_duration.as_secs_f64() * 1000.0;

        let samples = self.ping(address, port).await;
        let attempted = self.config.ping_count.max(1);

        let Some(ping_ms) = latency_f64(&samples) else {
            warn!(
                "All {} latency samples to {}:{} failed",
                attempted, host, port
            );
            return LatencyMetrics { dns_lookup_ms, ..LatencyMetrics::failed() };
        };

        let mut metrics = LatencyMetrics {
            ping_ms,
            jitter_ms: jitter_f64(&samples),
            packet_loss_percent: packet_loss_percent(attempted, samples.len()),
            dns_lookup_ms,
            tcp_connect_ms: 0.0,
            ssl_handshake_ms: 0.0,
            first_byte_ms: 0.0,
        };

        let tls = self.config.tls_ports.contains(&port);
        match detailed_timing(
            host.to_string(),
            address,
            port,
            tls,
            self.config.ping_timeout,
        )
        .await
        {
            Ok(timing) => {
                metrics.tcp_connect_ms = timing.tcp_connect_ms;
                metrics.ssl_handshake_ms = timing.ssl_handshake_ms;
                metrics.first_byte_ms = timing.first_byte_ms;
            }
            Err(e) => {
                debug!("Detailed timing to {}:{} failed: {}", host, port, e);
                metrics.tcp_connect_ms = -1.0;
                metrics.ssl_handshake_ms = -1.0;
                metrics.first_byte_ms = -1.0;
            }
        }

        info!(
            "Latency: {:.2} ms, jitter: {:.2} ms, loss: {:.1}%",
            metrics.ping_ms, metrics.jitter_ms, metrics.packet_loss_percent
        );

        metrics
    }

    /// Take `runs` independent connect samples spaced by the sample
    /// interval. Failed samples are skipped, so fewer than `runs`
    /// measurements may be returned.
    pub async fn sample(
        &self,
        host: &str,
        port: u16,
        runs: u32,
    ) -> Vec<RawMeasurement> {
        let address = match resolve_dns(host).await {
            Ok((address, _)) => address,
            Err(e) => {
                warn!("Latency sampling could not resolve {}: {}", host, e.message);
                return Vec::new();
            }
        };

        let mut measurements = Vec::with_capacity(runs as usize);

        for run in 1..=runs {
            match measure_tcp_latency(address, port, self.config.ping_timeout).await {
                Ok(ms) => {
                    debug!("Latency run {}/{}: {:.3} ms", run, runs, ms);
                    measurements.push(RawMeasurement::new(
                        run,
                        MeasurementType::Latency,
                        ms,
                    ));
                }
                Err(e) => debug!("Latency run {}/{} failed: {}", run, runs, e),
            }

            if run < runs {
                tokio::time::sleep(self.config.sample_interval).await;
            }
        }

        measurements
    }

    async fn ping(&self, address: IpAddr, port: u16) -> Vec<f64> {
        let count = self.config.ping_count.max(1);
        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            debug!("Latency measurement {}/{}", i + 1, count);

            match measure_tcp_latency(address, port, self.config.ping_timeout).await {
                Ok(ms) => samples.push(ms),
                Err(e) => debug!("Latency sample {} failed: {}", i + 1, e),
            }

            if i + 1 < count {
                tokio::time::sleep(self.config.ping_interval).await;
            }
        }

        samples
    }
}
