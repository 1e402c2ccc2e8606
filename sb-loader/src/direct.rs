use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use sb_core::{HttpAddress, HttpVersion, PipelineError, ResourceAddress};
use sb_istream::MemoryIstream;
use tokio::net::TcpStream;

use crate::any_http_client::{AnyHttpClient, ProbeState};
use crate::http_transport::{send_http1, send_http2, WireOutcome};
use crate::resource_loader::{drain_to_vec, ResourceLoader, ResourceRequest, ResourceResponse};
use sb_socket::{AlpnTlsFilter, NegotiatedProtocol};

/// How long a backend that just failed stays off-limits, matching
/// `AppConfig::proxy.backend_blacklist_secs` (spec §4.3, §5: ~20s).
const DEFAULT_BLACKLIST_SECS: u64 = 20;

/// The "selects a concrete backend by address variant" layer of the loader
/// chain (spec §4.3). Only the HTTP(S) and local-file variants are
/// implemented with a real transport here — FastCGI/CGI/AJP/WAS/NFS/pipe
/// backends each need their own protocol implementation and spawn service,
/// which this crate doesn't carry; see `DESIGN.md`.
pub struct DirectResourceLoader {
    probe: AnyHttpClient,
    blacklist: Mutex<HashMap<String, u64>>,
    blacklist_secs: u64,
    tls_config: Arc<ClientConfig>,
}

impl DirectResourceLoader {
    pub fn new() -> Result<Self, PipelineError> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        let tls_config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();

        Ok(Self {
            probe: AnyHttpClient::new(),
            blacklist: Mutex::new(HashMap::new()),
            blacklist_secs: DEFAULT_BLACKLIST_SECS,
            tls_config: Arc::new(tls_config),
        })
    }

    pub fn with_blacklist_secs(mut self, secs: u64) -> Self {
        self.blacklist_secs = secs;
        self
    }

    fn is_blacklisted(&self, host: &str, now: u64) -> bool {
        self.blacklist.lock().get(host).is_some_and(|&until| now < until)
    }

    fn mark_blacklisted(&self, host: &str, now: u64) {
        self.blacklist.lock().insert(host.to_string(), now + self.blacklist_secs);
    }

    async fn connect_tcp(addr: &HttpAddress) -> Result<TcpStream, PipelineError> {
        if let Some(&resolved) = addr.resolved.first() {
            return TcpStream::connect(resolved).await.map_err(PipelineError::Io);
        }
        TcpStream::connect(&addr.host_and_port)
            .await
            .map_err(PipelineError::Io)
    }

    fn host_only(host_and_port: &str) -> &str {
        host_and_port.rsplit_once(':').map_or(host_and_port, |(host, _)| host)
    }

    /// Learns (or reuses the cached answer for) which protocol `addr`'s
    /// origin speaks. Plaintext addresses aren't probed — their declared
    /// `version` is authoritative (no ALPN round trip to race); only TLS
    /// origins go through `AnyHttpClient` (spec §4.4: "for TLS origins
    /// where HTTP/2 is uncertain").
    async fn transport_for(&self, addr: &HttpAddress) -> Result<ProbeState, PipelineError> {
        if !addr.ssl {
            return Ok(match addr.version {
                HttpVersion::Http2 => ProbeState::Http2,
                HttpVersion::Http1 => ProbeState::Http1,
            });
        }

        let key = addr.origin_key();
        let tls_config = self.tls_config.clone();
        let addr = addr.clone();
        self.probe
            .resolve(&key, || async move {
                let stream = Self::connect_tcp(&addr).await?;
                let filter = AlpnTlsFilter::new((*tls_config).clone());
                let server_name = ServerName::try_from(Self::host_only(&addr.host_and_port).to_string())
                    .map_err(|e| PipelineError::Resource(e.to_string()))?;
                let (_tls, negotiated) = filter.handshake(server_name, stream).await?;
                Ok(match negotiated {
                    NegotiatedProtocol::Http2 => ProbeState::Http2,
                    NegotiatedProtocol::Http1 => ProbeState::Http1,
                })
            })
            .await
    }

    /// One connect-and-send attempt over a fresh socket (spec §4.3: "on
    /// each retry a fresh socket is pulled from the balancer"). The probe
    /// connection used to learn the transport (if any) isn't reused here —
    /// a deliberate simplification over the original's socket hand-off;
    /// see `DESIGN.md`.
    async fn try_once(
        &self,
        addr: &HttpAddress,
        method: &Method,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        transport: ProbeState,
    ) -> Result<WireOutcome, PipelineError> {
        if addr.ssl {
            let stream = Self::connect_tcp(addr).await?;
            let filter = AlpnTlsFilter::new((*self.tls_config).clone());
            let server_name = ServerName::try_from(Self::host_only(&addr.host_and_port).to_string())
                .map_err(|e| PipelineError::Resource(e.to_string()))?;
            let (tls, _negotiated) = filter.handshake(server_name, stream).await?;
            match transport {
                ProbeState::Http2 => send_http2(tls, method, &addr.path, headers, body.map(|b| b.to_vec())).await,
                _ => {
                    let mut tls = tls;
                    send_http1(&mut tls, method, &addr.host_and_port, &addr.path, headers, body).await
                }
            }
        } else {
            let stream = Self::connect_tcp(addr).await?;
            match transport {
                ProbeState::Http2 => send_http2(stream, method, &addr.path, headers, body.map(|b| b.to_vec())).await,
                _ => {
                    let mut stream = stream;
                    send_http1(&mut stream, method, &addr.host_and_port, &addr.path, headers, body).await
                }
            }
        }
    }

    async fn send_http(&self, addr: &HttpAddress, mut request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        if self.is_blacklisted(&addr.host_and_port, request.now) {
            return Err(PipelineError::BadGateway(format!(
                "{} is blacklisted as protocol-faulty",
                addr.host_and_port
            )));
        }

        let body_bytes = match request.body.take() {
            Some(mut b) => Some(drain_to_vec(b.as_mut())?),
            None => None,
        };
        // Retry-on-premature-close only applies when no request body was
        // supplied (spec §4.3): up to 2 retries, i.e. 3 attempts total.
        let max_attempts = if body_bytes.is_none() { 3 } else { 1 };

        let transport = self.transport_for(addr).await?;

        let mut last_premature = false;
        for _ in 0..max_attempts {
            match self
                .try_once(addr, &request.method, &request.headers, body_bytes.as_deref(), transport)
                .await
            {
                Ok(WireOutcome::Response { status, headers, body }) => {
                    return Ok(ResourceResponse::new(status, headers, Some(Box::new(MemoryIstream::new(body)))));
                }
                Ok(WireOutcome::PrematureClose) => {
                    last_premature = true;
                    continue;
                }
                Err(e) => {
                    self.mark_blacklisted(&addr.host_and_port, request.now);
                    return Err(e);
                }
            }
        }

        self.mark_blacklisted(&addr.host_and_port, request.now);
        if last_premature {
            Err(PipelineError::BadGateway(format!(
                "{} closed the connection before sending a response, {} times",
                addr.host_and_port, max_attempts
            )))
        } else {
            Err(PipelineError::BadGateway(addr.host_and_port.clone()))
        }
    }

    async fn send_local(path: &str, content_type: &Option<String>) -> Result<ResourceResponse, PipelineError> {
        let data = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::NotFound(path.to_string()),
            _ => PipelineError::Io(e),
        })?;

        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            if let Ok(value) = http::HeaderValue::from_str(ct) {
                headers.insert(http::header::CONTENT_TYPE, value);
            }
        }
        Ok(ResourceResponse::new(200, headers, Some(Box::new(MemoryIstream::new(data)))))
    }
}

#[async_trait(?Send)]
impl ResourceLoader for DirectResourceLoader {
    async fn send_request(&self, request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        if request.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match &request.address {
            ResourceAddress::None => Err(PipelineError::Resource("no backend configured".into())),
            ResourceAddress::Local { path, content_type } => {
                let path = path.clone();
                let content_type = content_type.clone();
                Self::send_local(&path, &content_type).await
            }
            ResourceAddress::Http(_) => {
                let ResourceAddress::Http(addr) = request.address.clone() else {
                    unreachable!()
                };
                self.send_http(&addr, request).await
            }
            other => Err(PipelineError::Resource(format!(
                "{} backend requires an external spawn service not implemented by this crate",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plaintext_http1_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
        });

        let loader = DirectResourceLoader::new().unwrap();
        let http_addr = HttpAddress::new(addr.to_string(), "/x");
        let request = ResourceRequest::new(Method::GET, ResourceAddress::Http(http_addr), 0);
        let response = loader.send_request(request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_premature_close_is_retried_then_blacklists() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..3 {
                let (sock, _) = listener.accept().await.unwrap();
                drop(sock);
            }
        });

        let loader = DirectResourceLoader::new().unwrap();
        let http_addr = HttpAddress::new(addr.to_string(), "/x");
        let request = ResourceRequest::new(Method::GET, ResourceAddress::Http(http_addr.clone()), 0);
        let result = loader.send_request(request).await;
        assert!(result.is_err());
        assert!(loader.is_blacklisted(&http_addr.host_and_port, 0));

        let request2 = ResourceRequest::new(Method::GET, ResourceAddress::Http(http_addr), 0);
        let result2 = loader.send_request(request2).await;
        assert!(matches!(result2, Err(PipelineError::BadGateway(_))));
    }

    #[tokio::test]
    async fn test_local_backend_reads_file() {
        let dir = tempfile_dir();
        let file_path = dir.join("hello.txt");
        std::fs::write(&file_path, b"hi there").unwrap();

        let loader = DirectResourceLoader::new().unwrap();
        let request = ResourceRequest::new(
            Method::GET,
            ResourceAddress::Local {
                path: file_path.to_string_lossy().to_string(),
                content_type: Some("text/plain".to_string()),
            },
            0,
        );
        let response = loader.send_request(request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_unimplemented_backend_errors_clearly() {
        let loader = DirectResourceLoader::new().unwrap();
        let request = ResourceRequest::new(
            Method::GET,
            ResourceAddress::Cgi {
                path: "/bin/true".into(),
                script_name: "true".into(),
            },
            0,
        );
        let result = loader.send_request(request).await;
        assert!(matches!(result, Err(PipelineError::Resource(_))));
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("sb-loader-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
