use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Top-level configuration for the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node ID (auto-generated if not set); used as the cluster-hash seed.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener address.
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// HTTPS listener address (ALPN probing happens on this one).
    #[serde(default = "default_https_addr")]
    pub https_addr: SocketAddr,

    /// Number of worker event loops (0 = one per core).
    #[serde(default)]
    pub workers: usize,

    /// Idle HTTP connection timeout, milliseconds. Spec §5: 30s.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Total time allowed to read request headers, milliseconds. Spec §5: 20s.
    #[serde(default = "default_header_timeout_ms")]
    pub header_timeout_ms: u64,

    /// Time allowed to read the request body, milliseconds. Spec §5: 30s.
    #[serde(default = "default_body_timeout_ms")]
    pub body_read_timeout_ms: u64,

    /// Time allowed to write the response, milliseconds. Spec §5: 30s.
    #[serde(default = "default_body_timeout_ms")]
    pub write_timeout_ms: u64,

    /// HTTP-client connect timeout, milliseconds. Spec §5: 30s.
    #[serde(default = "default_body_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Backend protocol-failure blacklist duration, seconds. Spec §5: 20s.
    #[serde(default = "default_blacklist_secs")]
    pub backend_blacklist_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session idle timeout, seconds.
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,

    /// Cluster size for session-id stickiness (0 disables stickiness).
    #[serde(default)]
    pub cluster_size: u32,

    /// This node's index within the cluster (must be < cluster_size).
    #[serde(default)]
    pub cluster_node: u32,

    /// shm region page size, bytes.
    #[serde(default = "default_shm_page_size")]
    pub shm_page_size: usize,

    /// shm region page count.
    #[serde(default = "default_shm_num_pages")]
    pub shm_num_pages: usize,

    /// Session-set cleanup scan interval, seconds. Spec §5: 60s.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Generic cache max size in bytes (per named cache instance).
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Hash bucket count hint.
    #[serde(default = "default_cache_buckets")]
    pub buckets: usize,

    /// Expiry sweep interval, seconds. Spec §5: 60s.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Listener address for the text-exposition endpoint.
    #[serde(default = "default_metrics_addr")]
    pub addr: SocketAddr,
}

impl AppConfig {
    /// Load configuration from YAML file + environment overlay.
    ///
    /// Environment variables use the prefix `APP_` with `__` as the
    /// nesting separator, e.g. `APP_PROXY__HTTP_ADDR`.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["switchboard.yaml", "/etc/switchboard/switchboard.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            proxy: ProxyConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            workers: 0,
            idle_timeout_ms: default_idle_timeout_ms(),
            header_timeout_ms: default_header_timeout_ms(),
            body_read_timeout_ms: default_body_timeout_ms(),
            write_timeout_ms: default_body_timeout_ms(),
            connect_timeout_ms: default_body_timeout_ms(),
            backend_blacklist_secs: default_blacklist_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_secs(),
            cluster_size: 0,
            cluster_node: 0,
            shm_page_size: default_shm_page_size(),
            shm_num_pages: default_shm_num_pages(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            buckets: default_cache_buckets(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
            addr: default_metrics_addr(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_https_addr() -> SocketAddr {
    "0.0.0.0:8443".parse().unwrap()
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_header_timeout_ms() -> u64 {
    20_000
}

fn default_body_timeout_ms() -> u64 {
    30_000
}

fn default_blacklist_secs() -> u64 {
    20
}

fn default_session_idle_secs() -> u64 {
    1_200
}

fn default_shm_page_size() -> usize {
    4096
}

fn default_shm_num_pages() -> usize {
    65_536
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_cache_max_size() -> usize {
    8 * 1024 * 1024
}

fn default_cache_buckets() -> usize {
    16_384
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}

fn default_true() -> bool {
    true
}
