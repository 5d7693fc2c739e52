// =============================================================================
// Logging bootstrap
// =============================================================================
//
// The engine logs through `tracing` and never installs a subscriber itself.
// Binaries and integration harnesses that want console output call `init()`
// once; repeated calls are harmless.
// =============================================================================

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber honouring `RUST_LOG`, defaulting to `info`.
pub fn init() {
    init_with_filter("info");
}

/// Install a formatted subscriber with an explicit default filter.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    // try_init so tests and embedders that already installed a subscriber
    // are not clobbered.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_harmless() {
        init();
        init_with_filter("debug");
    }
}
