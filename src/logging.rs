use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `default_filter` (for example `"switchyard=info"`) when the
/// variable is unset. Returns false if a subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
