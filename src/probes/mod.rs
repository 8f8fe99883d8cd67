use std::io::{Read, Write};

use url::Url;

use crate::errors::NetgaugeError;

pub(crate) mod connection;
pub mod download;
pub mod latency;
pub mod throughput;
pub mod upload;

pub use download::DownloadProbe;
pub use latency::{LatencyProbe, LatencyProbeConfig};
pub use throughput::{
    Direction, RunOutcome, ThroughputProbe, ThroughputReport, Throttle,
    ThrottleConfig,
};
pub use upload::UploadProbe;

/// User-Agent of every probe request.
pub(crate) static UA: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
);

pub trait IoReadAndWrite: Read + Write + Send {}

impl<T: Read + Write + Send> IoReadAndWrite for T {}

/// A plain HTTP/1.1 endpoint a throughput probe talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Base path, without a trailing slash
    pub path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, path: String::new() }
    }

    /// Parse an `http://host[:port][/base]` URL.
    pub fn parse(raw: &str) -> Result<Self, NetgaugeError> {
        let url = Url::parse(raw).map_err(|e| {
            NetgaugeError::config(format!("invalid endpoint URL {}", raw))
                .with_source(e)
        })?;

        if url.scheme() != "http" {
            return Err(NetgaugeError::config(format!(
                "unsupported scheme {} in {}, throughput endpoints must use http",
                url.scheme(),
                raw
            )));
        }

        let host = url.host_str().ok_or_else(|| {
            NetgaugeError::config(format!("endpoint URL {} has no host", raw))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            host: host.to_string(),
            port,
            path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// The request target for `route` below this endpoint's base path.
    pub fn join(&self, route: &str) -> String {
        format!("{}/{}", self.path, route.trim_start_matches('/'))
    }

    /// Value of the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
