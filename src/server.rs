//! Loopback transport the throughput and latency probes can be pointed at.
//!
//! Speaks just enough HTTP/1.1 for the probes: a download source of any
//! requested size, an upload sink that discards what it reads, and a tiny
//! `200 OK` for everything else. Nothing is throttled; pacing is the
//! probes' job. Every connection is closed after one response.

use std::net::SocketAddr;
use std::time::Duration;

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::errors::NetgaugeError;
use crate::measurements::BYTES_PER_MIB;
use crate::probes::connection::extract_http_headers;

/// Largest download the source will serve, in MiB.
const MAX_DOWNLOAD_MB: u64 = 1024;
const BLOCK_SIZE: usize = 64 * 1024;
const MAX_HEAD_BYTES: usize = 16 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TransportServer {
    listener: TcpListener,
}

impl TransportServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, NetgaugeError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetgaugeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped, handling each on its
    /// own task.
    pub async fn serve(self) -> Result<(), NetgaugeError> {
        info!("Transport server listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream).await {
                    debug!("Connection from {} ended: {}", peer, e.message);
                }
            });
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    headers: HeaderMap,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Download(u64),
    Upload,
    Ok,
    NotFound,
}

fn route(method: &str, path: &str) -> Route {
    let path = path.split('?').next().unwrap_or_default();
    let segments: Vec<&str> =
        path.split('/').filter(|segment| !segment.is_empty()).collect();

    match (method, segments.as_slice()) {
        ("GET", [.., "download", size]) => match size.parse::<u64>() {
            Ok(mb) => Route::Download(mb.min(MAX_DOWNLOAD_MB)),
            Err(_) => Route::NotFound,
        },
        ("POST", [.., "upload"]) => Route::Upload,
        ("GET", _) => Route::Ok,
        _ => Route::NotFound,
    }
}

async fn handle_connection(stream: TcpStream) -> Result<(), NetgaugeError> {
    stream.set_nodelay(true)?;
    let mut stream = BufReader::new(stream);

    let Some(head) =
        tokio::time::timeout(HEAD_TIMEOUT, read_request_head(&mut stream))
            .await??
    else {
        // Closed without a request, as the latency probe does.
        return Ok(());
    };
    debug!("{} {}", head.method, head.path);

    match route(&head.method, &head.path) {
        Route::Download(mb) => serve_download(&mut stream, mb).await,
        Route::Upload => {
            let received = drain_body(&mut stream, &head.headers).await?;
            debug!("Upload sink received {} bytes", received);
            write_response(&mut stream, "200 OK", &received.to_string()).await
        }
        Route::Ok => write_response(&mut stream, "200 OK", "ok").await,
        Route::NotFound => {
            write_response(&mut stream, "404 Not Found", "not found").await
        }
    }
}

/// Read the request line and headers. Returns `None` if the peer closed
/// the connection before sending anything.
async fn read_request_head<R>(
    reader: &mut R,
) -> Result<Option<RequestHead>, NetgaugeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = String::new();

    loop {
        let budget = MAX_HEAD_BYTES + 1 - head.len();
        let read = read_line_limited(reader, &mut head, budget).await?;
        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(NetgaugeError::network("request head truncated"));
        }

        if head.ends_with("\r\n\r\n") || head.ends_with("\n\n") {
            break;
        }

        if head.len() > MAX_HEAD_BYTES {
            return Err(NetgaugeError::network("request head too large"));
        }
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(path)) = (request_line.next(), request_line.next())
    else {
        return Err(NetgaugeError::network("malformed request line"));
    };

    Ok(Some(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        headers: extract_http_headers(&head),
    }))
}

/// `read_line` that stops after `limit` bytes even without a newline.
async fn read_line_limited<R>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> Result<usize, NetgaugeError>
where
    R: AsyncBufRead + Unpin,
{
    Ok((&mut *reader).take(limit as u64).read_line(line).await?)
}

async fn serve_download<W>(stream: &mut W, mb: u64) -> Result<(), NetgaugeError>
where
    W: AsyncWrite + Unpin,
{
    let total = mb * BYTES_PER_MIB as u64;
    let mut block = vec![0_u8; BLOCK_SIZE];
    StdRng::from_entropy().fill_bytes(&mut block);

    let head = format!(
        "HTTP/1.1 200 OK\r\n\
        Content-Type: application/octet-stream\r\n\
        Content-Length: {}\r\n\
        Cache-Control: no-store\r\n\
        Connection: close\r\n\
        \r\n",
        total
    );
    stream.write_all(head.as_bytes()).await?;

    let mut remaining = total;
    while remaining > 0 {
        let len = remaining.min(BLOCK_SIZE as u64) as usize;
        // The probe hangs up once its run time is over.
        if stream.write_all(&block[..len]).await.is_err() {
            debug!("Download client left with {} bytes unsent", remaining);
            return Ok(());
        }
        remaining -= len as u64;
    }

    stream.flush().await?;
    Ok(())
}

/// Read and discard a request body. Returns the number of body bytes.
async fn drain_body<R>(
    reader: &mut R,
    headers: &HeaderMap,
) -> Result<u64, NetgaugeError>
where
    R: AsyncBufRead + Unpin,
{
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));

    if chunked {
        return drain_chunked(reader).await;
    }

    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let copied =
        tokio::io::copy(&mut reader.take(length), &mut tokio::io::sink()).await?;
    if copied < length {
        return Err(NetgaugeError::network("request body truncated"));
    }

    Ok(copied)
}

async fn drain_chunked<R>(reader: &mut R) -> Result<u64, NetgaugeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    let mut line = String::new();

    loop {
        line.clear();
        if read_line_limited(reader, &mut line, MAX_HEAD_BYTES).await? == 0 {
            return Err(NetgaugeError::network("chunked body truncated"));
        }
        if !line.ends_with('\n') {
            return Err(NetgaugeError::network("chunk size line too long"));
        }

        let size = line.trim().split(';').next().unwrap_or_default();
        let size = u64::from_str_radix(size, 16).map_err(|_| {
            NetgaugeError::network(format!("bad chunk size {:?}", line.trim()))
        })?;

        if size == 0 {
            // Trailers end with an empty line.
            loop {
                line.clear();
                if read_line_limited(reader, &mut line, MAX_HEAD_BYTES).await? == 0
                    || line.trim().is_empty()
                {
                    return Ok(total);
                }
            }
        }

        let copied =
            tokio::io::copy(&mut (&mut *reader).take(size), &mut tokio::io::sink())
                .await?;
        if copied < size {
            return Err(NetgaugeError::network("chunk truncated"));
        }
        total += copied;

        line.clear();
        read_line_limited(reader, &mut line, 2).await?;
    }
}

async fn write_response<W>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> Result<(), NetgaugeError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\n\
        Content-Type: text/plain\r\n\
        Content-Length: {}\r\n\
        Connection: close\r\n\
        \r\n\
        {}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::connection::read_response_head;

    #[test]
    fn test_route() {
        assert_eq!(route("GET", "/download/75"), Route::Download(75));
        assert_eq!(route("GET", "/base/download/5000"), Route::Download(1024));
        assert_eq!(route("GET", "/download/lots"), Route::NotFound);
        assert_eq!(route("POST", "/upload"), Route::Upload);
        assert_eq!(route("POST", "/upload?x=1"), Route::Upload);
        assert_eq!(route("GET", "/"), Route::Ok);
        assert_eq!(route("GET", "/echo"), Route::Ok);
        assert_eq!(route("DELETE", "/upload"), Route::NotFound);
    }

    #[tokio::test]
    async fn test_read_request_head() {
        let mut raw: &[u8] =
            b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc";
        let head = read_request_head(&mut raw).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/upload");
        assert_eq!(head.headers.get(CONTENT_LENGTH).unwrap(), "3");
        assert_eq!(raw, b"abc");

        let mut empty: &[u8] = b"";
        assert!(read_request_head(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_chunked_body() {
        let mut raw: &[u8] = b"5\r\nhello\r\n3;ext=1\r\nabc\r\n0\r\n\r\n";
        assert_eq!(drain_chunked(&mut raw).await.unwrap(), 8);
        assert!(raw.is_empty());

        let mut truncated: &[u8] = b"a\r\nshort";
        assert!(drain_chunked(&mut truncated).await.is_err());
    }

    #[tokio::test]
    async fn test_request_head_reads_are_bounded() {
        let endless = vec![b'a'; MAX_HEAD_BYTES * 4];
        let mut raw: &[u8] = &endless;
        assert!(read_request_head(&mut raw).await.is_err());
        assert_eq!(raw.len(), endless.len() - (MAX_HEAD_BYTES + 1));

        let mut chunked = b"1".to_vec();
        chunked.extend(vec![b'0'; MAX_HEAD_BYTES * 2]);
        let mut raw: &[u8] = &chunked;
        assert!(drain_chunked(&mut raw).await.is_err());
        assert_eq!(raw.len(), chunked.len() - MAX_HEAD_BYTES);
    }

    #[tokio::test]
    async fn test_drain_content_length_body() {
        let headers = extract_http_headers("Content-Length: 4\r\n");
        let mut raw: &[u8] = b"datamore";
        assert_eq!(drain_body(&mut raw, &headers).await.unwrap(), 4);
        assert_eq!(raw, b"more");
    }

    #[tokio::test]
    async fn test_serves_download_and_upload() {
        let server = TransportServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /download/1 HTTP/1.1\r\nHost: t\r\n\r\n")
            .await
            .unwrap();
        let (status, headers) = read_response_head(&mut stream).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "1048576");
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body.len(), 1_048_576);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /upload HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n\
                4\r\nabcd\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        let (status, _) = read_response_head(&mut stream).await.unwrap();
        assert_eq!(status, 200);
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "4");
    }
}
