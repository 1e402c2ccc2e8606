/// Initializes the global `tracing` subscriber: env-filter controlled
/// verbosity, JSON formatting, matched to the teacher's `ando-server`
/// startup sequence.
///
/// `default_level` is used when `RUST_LOG` is unset.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .json()
        .init();
}
