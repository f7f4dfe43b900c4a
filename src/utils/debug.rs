//! Debug logging utilities.

use tracing_subscriber::EnvFilter;

/// Environment variable for debug mode.
pub const ERT_DEBUG_ENV: &str = "ERT_DEBUG";

/// Initialize debug logging based on the ERT_DEBUG environment variable or explicit flag.
pub fn init_debug_logging(force_debug: bool) {
    let debug_enabled = force_debug || std::env::var(ERT_DEBUG_ENV).is_ok();

    let filter = if debug_enabled {
        EnvFilter::new("egress_runtime=debug,warn")
    } else {
        EnvFilter::new("egress_runtime=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(debug_enabled)
        .with_ansi(true)
        .try_init()
        .ok();
}
