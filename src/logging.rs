//! Tracing setup for binaries and tests
//!
//! Library code only emits events; installing a subscriber is the entry
//! point's job. `RUST_LOG` controls filtering, defaulting to info for this
//! crate and warn for everything else.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,labplate=info"));
    // ignore failure when a subscriber is already installed (tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
