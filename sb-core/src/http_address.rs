use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// HTTP protocol version an [`HttpAddress`] should be contacted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpVersion {
    Http1,
    Http2,
}

/// Target of an HTTP(S) backend request (spec §3 `HttpAddress`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpAddress {
    pub version: HttpVersion,
    pub ssl: bool,
    pub host_and_port: String,
    pub path: String,
    /// SNI / certificate-selection hint, if any.
    pub certificate: Option<String>,
    /// Already-resolved candidate addresses, if the caller did the DNS
    /// lookup up front.
    pub resolved: Vec<SocketAddr>,
}

impl HttpAddress {
    pub fn new(host_and_port: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            version: HttpVersion::Http1,
            ssl: false,
            host_and_port: host_and_port.into(),
            path: path.into(),
            certificate: None,
            resolved: Vec::new(),
        }
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Spec invariant: at least one of host:port or a resolved address must
    /// be present.
    pub fn is_valid(&self) -> bool {
        !self.host_and_port.is_empty() || !self.resolved.is_empty()
    }

    /// The key AnyHttpClient probes on: `{name, bind, remote, filter-params}`
    /// serialized (spec §4.4). Here `name` is `host_and_port` and
    /// `filter-params` is the ssl flag plus certificate hint.
    pub fn origin_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.host_and_port,
            self.ssl,
            self.certificate.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let a = HttpAddress::new("example.com:443", "/");
        assert!(a.is_valid());
        let mut b = HttpAddress::new("", "/");
        assert!(!b.is_valid());
        b.resolved.push("127.0.0.1:80".parse().unwrap());
        assert!(b.is_valid());
    }

    #[test]
    fn test_origin_key_distinguishes_ssl() {
        let a = HttpAddress::new("example.com:443", "/").with_ssl(true);
        let b = HttpAddress::new("example.com:443", "/").with_ssl(false);
        assert_ne!(a.origin_key(), b.origin_key());
    }
}
