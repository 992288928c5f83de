//! Tracing subscriber setup for the `docbatch` binary

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` overrides `default_filter`. A second call is a no-op, so
/// tests may call this freely.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
