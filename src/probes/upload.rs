use crate::errors::NetgaugeError;
use crate::probes::connection::{read_response_head, resolve_dns, tcp_connect};
use crate::probes::throughput::{
    simulate, Direction, RunOutcome, Throttle, ThrottleConfig,
    ThroughputProbe, ThroughputReport,
};
use crate::probes::{Endpoint, UA};
use crate::session::TestConfiguration;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};

/// Bytes per second of run time the payload is sized for.
const PAYLOAD_BYTES_PER_SECOND: u64 = 15 * 1024 * 1024;
const MIN_PAYLOAD_BYTES: u64 = 5 * 1024 * 1024;
/// Chunks in the pool of random bytes that is cycled through.
const POOL_CHUNKS: usize = 8;

/// Upload test implementation for measuring upload bandwidth.
///
/// Each run POSTs a chunked body of pseudo-random bytes to `/upload` on the
/// transport endpoint, throttled to the reference rate, until the run
/// duration has elapsed or the payload is exhausted.
#[derive(Debug, Clone)]
pub struct UploadProbe {
    endpoint: Endpoint,
    throttle: ThrottleConfig,
    simulation_time_scale: f64,
}

impl UploadProbe {
    pub fn new(endpoint: Endpoint, throttle: ThrottleConfig) -> Self {
        Self { endpoint, throttle, simulation_time_scale: 1.0 }
    }

    /// Scale the waits of a simulated run; 0 skips them entirely.
    pub fn with_simulation_time_scale(mut self, scale: f64) -> Self {
        self.simulation_time_scale = scale;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Get the size of the upload payload in bytes.
    pub fn payload_bytes(config: &TestConfiguration) -> u64 {
        (u64::from(config.duration_seconds) * PAYLOAD_BYTES_PER_SECOND)
            .max(MIN_PAYLOAD_BYTES)
    }

    /// Measure, falling back to a simulated estimate when every run fails.
    ///
    /// The fallback is flagged as simulated on the returned metrics.
    pub async fn run_or_simulate(
        &self,
        config: &TestConfiguration,
    ) -> ThroughputReport {
        match self.measure(config).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    "Upload endpoint {} unavailable: {}",
                    self.endpoint.authority(),
                    e.message
                );
                simulate(Direction::Upload, config, self.simulation_time_scale)
                    .await
            }
        }
    }
}

impl ThroughputProbe for UploadProbe {
    fn direction(&self) -> Direction {
        Direction::Upload
    }

    async fn run_once(
        &self,
        config: &TestConfiguration,
    ) -> Result<RunOutcome, NetgaugeError> {
        let duration = Duration::from_secs(u64::from(config.duration_seconds));
        let io_timeout = duration + self.throttle.read_timeout_grace;
        let chunk_size = self.throttle.chunk_size.max(1);
        let payload = Self::payload_bytes(config);
        let pool = generate_test_data(chunk_size * POOL_CHUNKS);

        let (ip_address, _dns_duration) =
            resolve_dns(&self.endpoint.host).await?;
        let (mut stream, tcp_connect_duration) = tcp_connect(
            ip_address,
            self.endpoint.port,
            self.throttle.connect_timeout,
        )
        .await?;
        debug!("Connected to {} in {:?}", ip_address, tcp_connect_duration);

        let header = build_http_post_header(
            &self.endpoint,
            &self.endpoint.join("upload"),
        );
        debug!("\r\n{}", header);
        stream.write_all(header.as_bytes()).await?;

        let mut frame = Vec::with_capacity(chunk_size + 16);
        let start = Instant::now();
        let mut throttle = Throttle::starting_at(&self.throttle, start);
        let mut bytes: u64 = 0;
        let mut chunk_index = 0;

        while bytes < payload {
            if start.elapsed() >= duration {
                break;
            }

            let remaining = usize::try_from(payload - bytes).unwrap_or(usize::MAX);
            let len = chunk_size.min(remaining);
            let offset = (chunk_index % POOL_CHUNKS) * chunk_size;

            frame.clear();
            frame.extend_from_slice(format!("{:x}\r\n", len).as_bytes());
            frame.extend_from_slice(&pool[offset..offset + len]);
            frame.extend_from_slice(b"\r\n");

            timeout(io_timeout, stream.write_all(&frame)).await??;

            bytes += len as u64;
            chunk_index += 1;
            throttle.pace(len).await;
        }

        timeout(io_timeout, async {
            stream.write_all(b"0\r\n\r\n").await?;
            stream.flush().await
        })
        .await??;

        let streaming_duration = start.elapsed();

        let (status, _headers) =
            timeout(io_timeout, read_response_head(&mut stream)).await??;
        if status != 200 {
            return Err(NetgaugeError::network(format!(
                "upload sink answered with status {}",
                status
            )));
        }

        if bytes == 0 {
            return Err(NetgaugeError::network("no upload data was sent"));
        }

        Ok(RunOutcome::from_transfer(
            bytes,
            streaming_duration,
            self.throttle.min_streaming_duration,
        ))
    }
}

fn generate_test_data(size: usize) -> Vec<u8> {
    let mut data = vec![0_u8; size];
    StdRng::from_entropy().fill_bytes(&mut data);
    data
}

fn build_http_post_header(endpoint: &Endpoint, target: &str) -> String {
    format!(
        "POST {} HTTP/1.1\r\n\
        Host: {}\r\n\
        User-Agent: {}\r\n\
        Accept: */*\r\n\
        Content-Type: application/octet-stream\r\n\
        Cache-Control: no-cache\r\n\
        Transfer-Encoding: chunked\r\n\
        Connection: close\r\n\
        \r\n",
        target,
        endpoint.authority(),
        UA
    )
}
