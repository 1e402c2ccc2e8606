use crate::http_address::HttpAddress;
use serde::{Deserialize, Serialize};

/// A named backend target (spec §6 "Resource address"). Everything the
/// loader chain needs to invoke a given backend travels inside the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceAddress {
    /// No backend — used for static/synthetic responses.
    None,
    Local {
        path: String,
        content_type: Option<String>,
    },
    Http(HttpAddress),
    /// Local (forked) FastCGI-style process, addressed by path.
    Lhttp { path: String, args: Vec<String> },
    Cgi { path: String, script_name: String },
    FastCgi { path: String, script_name: String },
    /// Web Application Server: local, multi-instance, or remote.
    Was { path: String, args: Vec<String> },
    PipeFilter { path: String, args: Vec<String> },
    NfsAddress { server: String, export: String, path: String },
}

impl ResourceAddress {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceAddress::None => "none",
            ResourceAddress::Local { .. } => "local",
            ResourceAddress::Http(_) => "http",
            ResourceAddress::Lhttp { .. } => "lhttp",
            ResourceAddress::Cgi { .. } => "cgi",
            ResourceAddress::FastCgi { .. } => "fastcgi",
            ResourceAddress::Was { .. } => "was",
            ResourceAddress::PipeFilter { .. } => "pipe_filter",
            ResourceAddress::NfsAddress { .. } => "nfs",
        }
    }

    pub fn as_http(&self) -> Option<&HttpAddress> {
        match self {
            ResourceAddress::Http(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Per-request loader parameters (spec §3 `ResourceRequestParams`). All
/// fields are optional and opaque to the pipeline except to the caches that
/// key on them.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequestParams {
    /// Passed to the socket balancer; 0 disables stickiness.
    pub sticky_hash: u32,
    pub status_override: Option<u16>,
    pub body_etag: Option<String>,
    pub cache_tag: Option<String>,
    pub site_name: Option<String>,
    pub address_id: Option<String>,
    pub ignore_no_cache: bool,
    pub eager_cache: bool,
    pub auto_flush_cache: bool,
    pub want_metrics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ResourceAddress::None.kind(), "none");
        assert_eq!(
            ResourceAddress::Http(HttpAddress::new("h", "/")).kind(),
            "http"
        );
    }

    #[test]
    fn test_as_http() {
        let addr = ResourceAddress::Http(HttpAddress::new("h:80", "/x"));
        assert!(addr.as_http().is_some());
        assert!(ResourceAddress::None.as_http().is_none());
    }

    #[test]
    fn test_default_params_disable_stickiness() {
        let p = ResourceRequestParams::default();
        assert_eq!(p.sticky_hash, 0);
        assert!(!p.ignore_no_cache);
    }
}
