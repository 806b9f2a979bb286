//! stanzastream tools - workspace facade
//!
//! Re-exports the engine library and hosts the diagnostic binaries
//! under `src/bin/`.

// Re-export the workspace library for convenience
pub use stanzastream;

/// Install the tracing subscriber used by the diagnostic binaries.
/// Honors `RUST_LOG`; defaults to info for the engine.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stanzastream=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
