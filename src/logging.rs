use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the zone maintenance code.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to log only what the signing engine does:
///   RUST_LOG=zonekeeper::sign=DEBUG
///
/// Or to trace transfers but nothing else:
///   RUST_LOG=OFF,zonekeeper::xfr=TRACE
///
/// Calling this more than once is harmless, later calls do nothing.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
