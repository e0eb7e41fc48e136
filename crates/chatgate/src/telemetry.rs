use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Returns false when a subscriber was already installed, which leaves that one in place.
pub fn init_tracing(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
