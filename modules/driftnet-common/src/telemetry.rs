use tracing_subscriber::EnvFilter;

/// Initialize tracing for a driftnet process. Honors `RUST_LOG`, defaulting
/// the driftnet crates to info.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "driftnet=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
