//! Shared connection utilities for the probes.
//!
//! This module provides DNS resolution, connection establishment and the
//! small amount of HTTP/1.1 framing the throughput probes need.

use super::{IoReadAndWrite, UA};
use crate::errors::NetgaugeError;
use hickory_resolver::TokioResolver;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use log::debug;
use rustls_connector::RustlsConnector;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Response heads larger than this are treated as a protocol error.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Resolve a host, preferring IPv4 addresses.
///
/// Returns the resolved IP address and the time taken for DNS resolution.
/// IP literals are returned as-is without consulting the resolver.
pub async fn resolve_dns(host: &str) -> Result<(IpAddr, Duration), NetgaugeError> {
    let begin = Instant::now();

    if let Ok(address) = IpAddr::from_str(host) {
        return Ok((address, begin.elapsed()));
    }

    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| {
            NetgaugeError::dns("failed to read system resolver configuration")
                .with_source(e)
        })?
        .build();

    let begin = Instant::now();

    let response = resolver.lookup_ip(host).await.map_err(|e| {
        NetgaugeError::dns(format!("failed to resolve {}", host)).with_source(e)
    })?;

    let duration = begin.elapsed();

    let ipv4_address = response.iter().find(|addr| addr.is_ipv4());
    let address = ipv4_address
        .or_else(|| response.iter().next())
        .ok_or_else(|| {
            NetgaugeError::dns(format!("no addresses found for {}", host))
        })?;

    Ok((address, duration))
}

/// Establish a TCP connection to the given address and port.
///
/// Returns the connected stream and the time taken to establish the
/// connection.
pub async fn tcp_connect(
    address: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<(TcpStream, Duration), NetgaugeError> {
    let now = Instant::now();
    let stream =
        tokio::time::timeout(timeout, TcpStream::connect((address, port)))
            .await??;
    let tcp_connect_duration = now.elapsed();

    stream.set_nodelay(true)?;

    Ok((stream, tcp_connect_duration))
}

/// Measure TCP latency by performing a TCP handshake.
///
/// Runs on a blocking thread pool via `spawn_blocking` so the handshake is
/// timed without interference from other tasks on the runtime.
///
/// Returns the handshake time in milliseconds.
pub async fn measure_tcp_latency(
    ip_address: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<f64, NetgaugeError> {
    tokio::task::spawn_blocking(move || {
        let start = std::time::Instant::now();
        let stream = std::net::TcpStream::connect_timeout(
            &SocketAddr::new(ip_address, port),
            timeout,
        )?;
        let latency = start.elapsed();

        drop(stream);

        Ok::<_, NetgaugeError>(latency.as_secs_f64() * 1000.0)
    })
    .await?
}

/// Timing of one fully instrumented connection, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionTiming {
    pub tcp_connect_ms: f64,
    /// Zero when no TLS handshake was attempted.
    pub ssl_handshake_ms: f64,
    pub first_byte_ms: f64,
}

/// Open one connection and time its TCP handshake, the optional TLS
/// handshake, and the first response byte of a minimal GET request.
pub async fn detailed_timing(
    host: String,
    ip_address: IpAddr,
    port: u16,
    tls: bool,
    timeout: Duration,
) -> Result<ConnectionTiming, NetgaugeError> {
    tokio::task::spawn_blocking(move || {
        let now = std::time::Instant::now();
        let tcp = std::net::TcpStream::connect_timeout(
            &SocketAddr::new(ip_address, port),
            timeout,
        )?;
        let tcp_connect_ms = now.elapsed().as_secs_f64() * 1000.0;

        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let (mut stream, ssl_handshake_ms): (Box<dyn IoReadAndWrite>, f64) =
            if tls {
                let connector: RustlsConnector =
                    RustlsConnector::new_with_native_certs().unwrap_or_else(
                        |_| RustlsConnector::new_with_webpki_roots_certs(),
                    );
                let now = std::time::Instant::now();
                let mut stream = connector.connect(&host, tcp).map_err(|e| {
                    NetgaugeError::tls(format!(
                        "TLS handshake with {} failed: {}",
                        host, e
                    ))
                })?;
                stream.flush()?;
                (Box::new(stream), now.elapsed().as_secs_f64() * 1000.0)
            } else {
                (Box::new(tcp), 0.0)
            };

        let request = format!(
            "GET / HTTP/1.1\r\n\
            Host: {}\r\n\
            User-Agent: {}\r\n\
            Connection: close\r\n\
            \r\n",
            host, UA
        );

        let now = std::time::Instant::now();
        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut one_byte_buffer = [0_u8];
        stream.read_exact(&mut one_byte_buffer)?;
        let first_byte_ms = now.elapsed().as_secs_f64() * 1000.0;

        Ok::<_, NetgaugeError>(ConnectionTiming {
            tcp_connect_ms,
            ssl_handshake_ms,
            first_byte_ms,
        })
    })
    .await?
}

/// Read a response head one byte at a time up to the blank line.
///
/// Returns the status code and the parsed headers; the stream is left
/// positioned at the first body byte.
pub async fn read_response_head<R>(
    stream: &mut R,
) -> Result<(u16, HeaderMap), NetgaugeError>
where
    R: AsyncRead + Unpin,
{
    let mut head: Vec<u8> = Vec::new();
    let mut one_byte_buffer = [0_u8];

    loop {
        if stream.read(&mut one_byte_buffer).await? == 0 {
            return Err(NetgaugeError::network(
                "connection closed before the response head was complete",
            ));
        }

        head.push(one_byte_buffer[0]);

        if head.ends_with(b"\r\n\r\n") {
            break;
        }

        if head.len() > MAX_HEAD_BYTES {
            return Err(NetgaugeError::network("response head too large"));
        }
    }

    let head = String::from_utf8_lossy(&head);
    debug!("\r\n{}", head);

    let status = parse_status_code(&head).ok_or_else(|| {
        NetgaugeError::network(format!(
            "malformed status line: {}",
            head.lines().next().unwrap_or_default()
        ))
    })?;

    Ok((status, extract_http_headers(&head)))
}

fn parse_status_code(head: &str) -> Option<u16> {
    let status_line = head.lines().next()?;
    let mut parts = status_line.split_whitespace();

    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }

    parts.next()?.parse().ok()
}

/// Parse `Name: value` lines into a header map, skipping anything that is
/// not a valid header.
pub fn extract_http_headers(raw_headers: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for line in raw_headers.lines() {
        let line = line.trim();

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };

        let (Ok(name), Ok(value)) = (
            HeaderName::from_str(name.trim()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };

        headers.append(name, value);
    }

    headers
}
