use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logs to stdout, at `info` unless `RUST_LOG` says otherwise.
pub(crate) fn tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
