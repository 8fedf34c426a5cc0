use tracing::Level;

/// Map a configured level name to a `tracing` level. Unknown names fall back
/// to `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the process-wide log subscriber.
///
/// Logs go to stderr: the CLI prints message ids and payloads on stdout.
/// Calling this again is a no-op, the first subscriber stays installed.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
