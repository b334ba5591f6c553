use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Filter for the provider's own subscriber, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "KVP11_LOG";

static INIT: Once = Once::new();

/// Install a stderr subscriber unless the host process already has one.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
        // A host that installed its own global subscriber keeps it.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}
