//! Tracing subscriber setup.

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `level`. Returns false if a subscriber was already installed.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) -> bool {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) -> bool {
    false
}
