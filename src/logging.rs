use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// Records from the `log` facade used by the delivery crate are bridged
/// into the same subscriber. Output goes to stderr; stdout carries only the
/// final summary.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "logs-json")]
    let result = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    #[cfg(not(feature = "logs-json"))]
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(e) = result {
        eprintln!("deliver: logging already initialised: {}", e);
    }
}
