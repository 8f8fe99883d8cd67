use crate::errors::NetgaugeError;
use crate::probes::connection::{read_response_head, resolve_dns, tcp_connect};
use crate::probes::throughput::{
    Direction, RunOutcome, Throttle, ThrottleConfig, ThroughputProbe,
};
use crate::probes::{Endpoint, UA};
use crate::session::TestConfiguration;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};

/// Largest file the download source is asked for, in MiB.
const MAX_FILE_SIZE_MB: u64 = 1024;

/// Download test implementation for measuring download bandwidth.
///
/// Each run GETs `/download/{mb}` from the transport endpoint and reads the
/// body in throttled chunks until the run duration has elapsed.
#[derive(Debug, Clone)]
pub struct DownloadProbe {
    endpoint: Endpoint,
    throttle: ThrottleConfig,
}

impl DownloadProbe {
    pub fn new(endpoint: Endpoint, throttle: ThrottleConfig) -> Self {
        Self { endpoint, throttle }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Size of the file to request, in MiB.
    ///
    /// Sized at 15 MiB per second of run time so the body outlasts the run
    /// at the reference rate, with floors of 50 MiB for runs up to 5 s and
    /// 75 MiB up to 15 s. An explicit `test_file_size_mb` wins.
    pub fn file_size_mb(config: &TestConfiguration) -> u64 {
        if let Some(size) = config.test_file_size_mb {
            return (size.ceil() as u64).clamp(1, MAX_FILE_SIZE_MB);
        }

        let duration = u64::from(config.duration_seconds);
        let target = duration * 15;

        let size = if duration <= 5 {
            target.max(50)
        } else if duration <= 15 {
            target.max(75)
        } else {
            target
        };

        size.min(MAX_FILE_SIZE_MB)
    }
}

impl ThroughputProbe for DownloadProbe {
    fn direction(&self) -> Direction {
        Direction::Download
    }

    async fn run_once(
        &self,
        config: &TestConfiguration,
    ) -> Result<RunOutcome, NetgaugeError> {
        let duration = Duration::from_secs(u64::from(config.duration_seconds));
        let read_timeout = duration + self.throttle.read_timeout_grace;
        let size_mb = Self::file_size_mb(config);

        let (ip_address, _dns_duration) =
            resolve_dns(&self.endpoint.host).await?;
        let (mut stream, tcp_connect_duration) = tcp_connect(
            ip_address,
            self.endpoint.port,
            self.throttle.connect_timeout,
        )
        .await?;
        debug!("Connected to {} in {:?}", ip_address, tcp_connect_duration);

        let header = build_http_header(
            &self.endpoint,
            &self.endpoint.join(&format!("download/{}", size_mb)),
        );
        debug!("\r\n{}", header);

        stream.write_all(header.as_bytes()).await?;
        stream.flush().await?;

        let (status, _headers) =
            timeout(read_timeout, read_response_head(&mut stream)).await??;
        if !(200..300).contains(&status) {
            return Err(NetgaugeError::network(format!(
                "download source answered with status {}",
                status
            )));
        }

        let mut buffer = vec![0_u8; self.throttle.chunk_size.max(1)];
        let start = Instant::now();
        let mut throttle = Throttle::starting_at(&self.throttle, start);
        let mut bytes: u64 = 0;

        loop {
            let read = timeout(read_timeout, stream.read(&mut buffer)).await??;
            if read == 0 {
                break;
            }

            // A chunk that arrives after the deadline is not counted.
            if start.elapsed() >= duration {
                break;
            }

            bytes += read as u64;
            throttle.pace(read).await;
        }

        let streaming_duration = start.elapsed();

        if bytes == 0 {
            return Err(NetgaugeError::network(
                "download source sent an empty body",
            ));
        }

        Ok(RunOutcome::from_transfer(
            bytes,
            streaming_duration,
            self.throttle.min_streaming_duration,
        ))
    }
}

fn build_http_header(endpoint: &Endpoint, target: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
        Host: {}\r\n\
        User-Agent: {}\r\n\
        Accept: */*\r\n\
        Cache-Control: no-cache\r\n\
        Connection: close\r\n\
        \r\n",
        target,
        endpoint.authority(),
        UA
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TestType;

    #[test]
    fn test_file_size_scales_with_duration() {
        let size = |duration| {
            DownloadProbe::file_size_mb(&TestConfiguration::new(
                TestType::DownloadOnly,
                duration,
                1,
            ))
        };

        assert_eq!(size(5), 75);
        assert_eq!(size(10), 150);
        assert_eq!(size(15), 225);
        assert_eq!(size(60), 900);
    }

    #[test]
    fn test_file_size_override() {
        let config = TestConfiguration {
            test_file_size_mb: Some(12.2),
            ..TestConfiguration::default()
        };
        assert_eq!(DownloadProbe::file_size_mb(&config), 13);

        let config = TestConfiguration {
            test_file_size_mb: Some(50_000.0),
            ..TestConfiguration::default()
        };
        assert_eq!(DownloadProbe::file_size_mb(&config), MAX_FILE_SIZE_MB);
    }

    #[test]
    fn test_build_http_header() {
        let endpoint = Endpoint::new("127.0.0.1", 8080);
        let header = build_http_header(&endpoint, "/download/75");
        assert!(header.starts_with("GET /download/75 HTTP/1.1\r\n"));
        assert!(header.contains("Host: 127.0.0.1:8080\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_run_against_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = DownloadProbe::new(
            Endpoint::new("127.0.0.1", port),
            ThrottleConfig::default(),
        );
        let config = TestConfiguration::new(TestType::DownloadOnly, 5, 1);
        let error = probe.run_once(&config).await.unwrap_err();
        assert!(error.kind.is_probe_failure());
    }
}
