use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use sb_core::PipelineError;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Negotiated application protocol on a TLS connection, decided by ALPN —
/// the building block [`crate::FilteredSocket`] needs to support
/// `AnyHttpClient`'s HTTP/1-vs-HTTP/2 probe (spec §4.4) without a second
/// round trip: the answer is known the moment the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    Http1,
    Http2,
}

impl NegotiatedProtocol {
    fn from_alpn(proto: &[u8]) -> Self {
        if proto == b"h2" {
            NegotiatedProtocol::Http2
        } else {
            NegotiatedProtocol::Http1
        }
    }
}

/// The "identity" filter: hands back the plain `TcpStream` unchanged. Exists
/// so callers can treat plaintext and TLS connections uniformly (both
/// produce something `FilteredSocket::new` accepts) — spec §4.2's filter
/// chain collapses to a no-op here.
pub struct IdentityFilter;

impl IdentityFilter {
    pub fn wrap(stream: TcpStream) -> TcpStream {
        stream
    }
}

/// Performs the client-side TLS handshake with `h2` and `http/1.1` offered
/// via ALPN, and reports which one the server picked. Grounded on the ALPN
/// probe described in spec §4.4 "AnyHttpClient": the protocol choice is
/// resolved once, here, rather than speculatively parsing bytes to guess.
pub struct AlpnTlsFilter {
    connector: TlsConnector,
}

impl AlpnTlsFilter {
    pub fn new(client_config: ClientConfig) -> Self {
        let mut client_config = client_config;
        client_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(client_config)),
        }
    }

    pub async fn handshake(
        &self,
        server_name: ServerName<'static>,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, NegotiatedProtocol), PipelineError> {
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(PipelineError::Io)?;

        let proto = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(NegotiatedProtocol::from_alpn)
            .unwrap_or(NegotiatedProtocol::Http1);

        Ok((tls, proto))
    }
}
