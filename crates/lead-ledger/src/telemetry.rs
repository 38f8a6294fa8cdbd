use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing() {
    init_tracing_with("info");
}

/// Install the global subscriber. `RUST_LOG` wins over `default_directive`.
/// A second call leaves the first subscriber in place.
pub fn init_tracing_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init();

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
