//! Engine configuration.
//!
//! An [`EngineConfig`] names the transport endpoints the throughput probes
//! talk to and the host the latency probe samples, and carries the tunables
//! of every component.

use crate::errors::NetgaugeError;
use crate::probes::{Endpoint, LatencyProbeConfig, ThrottleConfig};
use crate::validation::ValidationThresholds;

/// Configuration for the measurement engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Serves `GET /download/{mb}`.
    pub download_endpoint: Endpoint,
    /// Accepts `POST /upload`.
    pub upload_endpoint: Endpoint,
    /// Host the latency probe connects to.
    pub latency_host: String,
    pub latency_port: u16,
    pub latency: LatencyProbeConfig,
    pub throttle: ThrottleConfig,
    pub validation: ValidationThresholds,
    /// Sessions allowed to run at once; further sessions queue.
    /// Default: 16
    pub max_concurrent_sessions: usize,
    /// Multiplier on the waits of a simulated throughput run.
    /// Default: 1.0
    pub simulation_time_scale: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let endpoint = Endpoint::new("127.0.0.1", 8080);

        Self {
            latency_host: endpoint.host.clone(),
            latency_port: endpoint.port,
            download_endpoint: endpoint.clone(),
            upload_endpoint: endpoint,
            latency: LatencyProbeConfig::default(),
            throttle: ThrottleConfig::default(),
            validation: ValidationThresholds::default(),
            max_concurrent_sessions: 16,
            simulation_time_scale: 1.0,
        }
    }
}

impl EngineConfig {
    /// Point every probe at the transport server at `url`.
    pub fn for_server(url: &str) -> Result<Self, NetgaugeError> {
        let endpoint = Endpoint::parse(url)?;

        Ok(Self {
            latency_host: endpoint.host.clone(),
            latency_port: endpoint.port,
            download_endpoint: endpoint.clone(),
            upload_endpoint: endpoint,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), NetgaugeError> {
        if self.max_concurrent_sessions == 0 {
            return Err(NetgaugeError::config(
                "max_concurrent_sessions must be at least 1",
            ));
        }

        if !(self.throttle.reference_rate_mbps.is_finite()
            && self.throttle.reference_rate_mbps > 0.0)
        {
            return Err(NetgaugeError::config(format!(
                "reference rate must be positive, got {}",
                self.throttle.reference_rate_mbps
            )));
        }

        if self.throttle.chunk_size == 0 {
            return Err(NetgaugeError::config("chunk size must be positive"));
        }

        if !(self.simulation_time_scale.is_finite()
            && self.simulation_time_scale >= 0.0)
        {
            return Err(NetgaugeError::config(format!(
                "simulation time scale must be non-negative, got {}",
                self.simulation_time_scale
            )));
        }

        if self.latency.ping_count == 0 {
            return Err(NetgaugeError::config("ping count must be at least 1"));
        }

        if self.latency_host.is_empty() {
            return Err(NetgaugeError::config("latency host is empty")
                .with_suggestion("Pass --latency-host or a --server URL"));
        }

        Ok(())
    }
}
