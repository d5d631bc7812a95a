//! Development-time tracing for debugging the engine.
//!
//! Host applications own their own subscriber; this helper exists for
//! examples and ad-hoc debugging. Reads `RUST_LOG`, defaults to `warn`,
//! writes compact output to stderr.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
