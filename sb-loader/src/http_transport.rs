use http::{HeaderMap, HeaderName, HeaderValue, Method};
use sb_core::PipelineError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A response received over the wire, or the premature-close signal the
/// retry logic in [`crate::direct`] needs (spec §4.3 "retry-on-premature-
/// close": only a close seen *before any response header bytes* counts).
pub enum WireOutcome {
    Response { status: u16, headers: HeaderMap, body: Vec<u8> },
    PrematureClose,
}

fn protocol_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Protocol(e.to_string())
}

/// A connection-level failure on the write side, before any response byte
/// has been seen, is indistinguishable from the backend closing the socket
/// early — both count as premature close for retry purposes (spec §4.3).
fn premature_or_err(e: std::io::Error) -> Result<WireOutcome, PipelineError> {
    use std::io::ErrorKind::*;
    match e.kind() {
        BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof => Ok(WireOutcome::PrematureClose),
        _ => Err(PipelineError::Io(e)),
    }
}

/// Writes a request and reads its response over a raw HTTP/1.1 connection.
/// No chunked-transfer-encoding support at this layer (bodies are either
/// `Content-Length`-delimited or read to EOF) — chunked framing is the
/// istream framework's `Dechunk` filter's job higher up the pipeline, not
/// this wire adapter's.
pub async fn send_http1(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    method: &Method,
    host_and_port: &str,
    path: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Result<WireOutcome, PipelineError> {
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {host_and_port}\r\n");
    for (name, value) in headers.iter() {
        request.push_str(name.as_str());
        request.push_str(": ");
        request.push_str(value.to_str().unwrap_or(""));
        request.push_str("\r\n");
    }
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: keep-alive\r\n\r\n");

    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return premature_or_err(e);
    }
    if let Some(body) = body {
        if let Err(e) = stream.write_all(body).await {
            return premature_or_err(e);
        }
    }
    if let Err(e) = stream.flush().await {
        return premature_or_err(e);
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break Some(pos);
        }
        let n = stream.read(&mut chunk).await.map_err(PipelineError::Io)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(WireOutcome::PrematureClose);
            }
            return Err(protocol_error("connection closed mid-header"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let header_end = header_end.expect("loop only exits via break or early return");

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut parsed_headers);
    let parse_status = response.parse(&buf[..header_end]).map_err(protocol_error)?;
    if parse_status.is_partial() {
        return Err(protocol_error("incomplete status line"));
    }
    let status = response.code.ok_or_else(|| protocol_error("missing status code"))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    for h in response.headers.iter() {
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value).ok().and_then(|s| s.parse::<usize>().ok());
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(h.name.as_bytes()), HeaderValue::from_bytes(h.value)) {
            headers.append(name, value);
        }
    }

    let mut body_bytes = buf[header_end..].to_vec();
    if let Some(len) = content_length {
        while body_bytes.len() < len {
            let n = stream.read(&mut chunk).await.map_err(PipelineError::Io)?;
            if n == 0 {
                return Err(protocol_error("connection closed before full body arrived"));
            }
            body_bytes.extend_from_slice(&chunk[..n]);
        }
        body_bytes.truncate(len);
    } else if method != Method::HEAD && status != 204 && status != 304 {
        loop {
            let n = stream.read(&mut chunk).await.map_err(PipelineError::Io)?;
            if n == 0 {
                break;
            }
            body_bytes.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(WireOutcome::Response {
        status,
        headers,
        body: body_bytes,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Sends a request over an already-negotiated HTTP/2 connection via the
/// `h2` crate, draining the full response body (this crate has no
/// streaming consumer downstream of the loader yet — bodies are staged in
/// memory the same way [`crate::buffered`] stages request bodies).
pub async fn send_http2(
    io: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    body: Option<Vec<u8>>,
) -> Result<WireOutcome, PipelineError> {
    let (mut client, connection) = h2::client::handshake(io).await.map_err(protocol_error)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "h2 connection driver exited");
        }
    });

    let mut builder = http::Request::builder().method(method.clone()).uri(uri);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    let request = builder.body(()).map_err(protocol_error)?;

    let (response_fut, mut send_stream) = client.send_request(request, body.is_none()).map_err(protocol_error)?;
    if let Some(body) = body {
        send_stream.send_data(body.into(), true).map_err(protocol_error)?;
    }

    let response = response_fut.await.map_err(protocol_error)?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let mut body_stream = response.into_body();
    let mut data = Vec::new();
    while let Some(chunk) = body_stream.data().await {
        let chunk = chunk.map_err(protocol_error)?;
        let _ = body_stream.flow_control().release_capacity(chunk.len());
        data.extend_from_slice(&chunk);
    }

    Ok(WireOutcome::Response {
        status,
        headers,
        body: data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_send_http1_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /hi HTTP/1.1"));
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let outcome = send_http1(&mut client, &Method::GET, "example.com", "/hi", &HeaderMap::new(), None)
            .await
            .unwrap();
        server.await.unwrap();

        match outcome {
            WireOutcome::Response { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"hello");
            }
            WireOutcome::PrematureClose => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn test_send_http1_detects_premature_close() {
        let (mut client, server) = duplex(1024);
        drop(server);
        let outcome = send_http1(&mut client, &Method::GET, "h", "/", &HeaderMap::new(), None).await.unwrap();
        assert!(matches!(outcome, WireOutcome::PrematureClose));
    }

    #[tokio::test]
    async fn test_send_http1_reads_to_eof_without_content_length() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\nno-length-body").await.unwrap();
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let outcome = send_http1(&mut client, &Method::GET, "h", "/", &HeaderMap::new(), None).await.unwrap();
        server.await.unwrap();
        match outcome {
            WireOutcome::Response { body, .. } => assert_eq!(body, b"no-length-body"),
            WireOutcome::PrematureClose => panic!("expected a response"),
        }
    }
}
