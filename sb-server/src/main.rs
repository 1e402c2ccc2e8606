//! Wires the pipeline crates (shm, session, cache, loader, observability)
//! into a runnable process: config load, background maintenance loops, a
//! Prometheus text-exposition listener, and graceful shutdown. The request
//! handler itself — accepting connections, routing, speaking the wire
//! protocol to clients — is an external collaborator (spec §2) and is not
//! implemented here.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tokio::time::interval;
use tracing::{error, info};

use sb_cache::Cache;
use sb_core::config::AppConfig;
use sb_core::ResourceAddress;
use sb_loader::{BufferedResourceLoader, DirectResourceLoader, FilterResourceLoader, ResourceLoader, ResourceRequest};
use sb_observability::{init_tracing, MetricsCollector};
use sb_session::SessionManager;
use sb_shm::Shm;

#[derive(Parser, Debug)]
#[command(name = "sb-server", version, about = "switchboard request-execution core")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Runs on a current-thread runtime, matching SPEC_FULL.md §5: the event
/// loop is a single-threaded reactor, one per worker in a multi-process
/// deployment. `ResourceLoader` futures are `?Send` for the same reason,
/// so every task that touches the loader chain is spawned on a `LocalSet`.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = AppConfig::load(cli.config.as_deref())?;
    info!(node_id = %config.node_id, "switchboard starting");

    let local = LocalSet::new();
    local.run_until(run(config)).await
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsCollector::new()?);

    let shm = Arc::new(Shm::new(config.session.shm_page_size, config.session.shm_num_pages));
    let sessions = Arc::new(SessionManager::new(
        config.session.idle_timeout_secs,
        config.session.cluster_size,
        config.session.cluster_node,
        Arc::clone(&shm),
    ));

    let response_cache = Rc::new(RefCell::new(Cache::<Vec<u8>>::new(config.cache.max_size)));

    let loader = {
        let direct = DirectResourceLoader::new()?.with_blacklist_secs(config.proxy.backend_blacklist_secs);
        let buffered = BufferedResourceLoader::new(direct);
        FilterResourceLoader::new(buffered, config.cache.max_size, config.session.cleanup_interval_secs)
    };

    info!(
        sessions = sessions.len(),
        cache_max_size = response_cache.borrow().max_size(),
        "pipeline wired: shm -> session manager, direct -> buffered -> filter loader chain"
    );

    let session_task = {
        let sessions = Arc::clone(&sessions);
        let metrics = Arc::clone(&metrics);
        let interval_secs = config.session.cleanup_interval_secs.max(1);
        tokio::task::spawn_local(async move {
            let mut tick = interval(Duration::from_secs(interval_secs));
            loop {
                tick.tick().await;
                let purged_more = sessions.purge(now_secs());
                metrics.sessions_active.set(sessions.len() as i64);
                info!(purged_more, active = sessions.len(), "session purge sweep");
            }
        })
    };

    let cache_task = {
        let cache = Rc::clone(&response_cache);
        let interval_secs = config.cache.cleanup_interval_secs.max(1);
        tokio::task::spawn_local(async move {
            let mut tick = interval(Duration::from_secs(interval_secs));
            loop {
                tick.tick().await;
                let mut cache = cache.borrow_mut();
                while cache.expire_once(now_secs()) {}
            }
        })
    };

    let metrics_task = {
        let metrics = Arc::clone(&metrics);
        let addr = config.observability.prometheus.addr;
        let enabled = config.observability.prometheus.enabled;
        tokio::task::spawn_local(async move {
            if !enabled {
                return;
            }
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "metrics endpoint listening");
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                let metrics = Arc::clone(&metrics);
                                tokio::task::spawn_local(serve_metrics(stream, metrics));
                            }
                            Err(e) => error!(error = %e, "metrics listener accept failed"),
                        }
                    }
                }
                Err(e) => error!(error = %e, %addr, "failed to bind metrics listener"),
            }
        })
    };

    if let Err(e) = demonstrate_loader_chain(&loader).await {
        error!(error = %e, "startup loader demonstration failed");
    }

    wait_for_shutdown().await?;
    info!("shutdown signal received, stopping");

    session_task.abort();
    cache_task.abort();
    metrics_task.abort();

    info!("switchboard stopped");
    Ok(())
}

/// Proves the loader chain end to end at startup: a synthetic local
/// request flows through `Filter -> Buffered -> Direct`.
async fn demonstrate_loader_chain(loader: &FilterResourceLoader<BufferedResourceLoader<DirectResourceLoader>>) -> anyhow::Result<()> {
    let request = ResourceRequest::new(
        http::Method::GET,
        ResourceAddress::Local {
            path: "/dev/null".to_string(),
            content_type: Some("text/plain".to_string()),
        },
        now_secs(),
    );
    let response = loader.send_request(request).await?;
    let body_available = response.body.as_deref().map(|b| b.get_available(false)).unwrap_or(0);
    info!(status = response.status, body_available, "loader chain demonstration request completed");
    Ok(())
}

async fn serve_metrics(mut stream: tokio::net::TcpStream, metrics: Arc<MetricsCollector>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard).await;

    let body = metrics.gather_text();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
