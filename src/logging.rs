use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries and demos built on this crate.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` applies to every
/// target. Calling this more than once is harmless.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
